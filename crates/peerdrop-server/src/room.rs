use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};

use rand::Rng;

use peerdrop_shared::constants::{DEFAULT_AUTO_ROOM, ROOM_CODE_ALPHABET, ROOM_CODE_LEN};

use crate::hub::SessionId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomKind {
    /// Keyed by network-address prefix, joined automatically
    Auto,
    /// Keyed by a short code shared between users
    Coded,
}

/// A set of sessions that can see and relay to each other.
///
/// Members are referenced by id only; session lifetime belongs to the
/// transport, not the room.
#[derive(Debug)]
pub struct Room {
    pub id: String,
    pub kind: RoomKind,
    members: HashSet<SessionId>,
}

impl Room {
    pub fn new(id: impl Into<String>, kind: RoomKind) -> Self {
        Self {
            id: id.into(),
            kind,
            members: HashSet::new(),
        }
    }

    pub fn add(&mut self, session: &str) {
        self.members.insert(session.to_string());
    }

    pub fn remove(&mut self, session: &str) -> bool {
        self.members.remove(session)
    }

    pub fn contains(&self, session: &str) -> bool {
        self.members.contains(session)
    }

    /// Every member except `exclude`.
    pub fn others<'a>(&'a self, exclude: &'a str) -> impl Iterator<Item = &'a SessionId> + 'a {
        self.members.iter().filter(move |id| id.as_str() != exclude)
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

/// Derive the auto-scope room id for a remote address.
///
/// IPv4 addresses group by their first three octets (`"192.168.1"`), IPv6 by
/// their leading 64 bits (`"fe80:0000:0000:0000"`). A trailing port is
/// ignored. Anything unparseable lands in [`DEFAULT_AUTO_ROOM`].
pub fn auto_room_id(addr: &str) -> String {
    let Some(ip) = parse_host(addr.trim()) else {
        return DEFAULT_AUTO_ROOM.to_string();
    };

    let ip = match ip {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(IpAddr::V6(v6)),
        v4 => v4,
    };

    match ip {
        IpAddr::V4(v4) => {
            let o = v4.octets();
            format!("{}.{}.{}", o[0], o[1], o[2])
        }
        IpAddr::V6(v6) => {
            let b = v6.octets();
            format!(
                "{:02x}{:02x}:{:02x}{:02x}:{:02x}{:02x}:{:02x}{:02x}",
                b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]
            )
        }
    }
}

fn parse_host(addr: &str) -> Option<IpAddr> {
    if let Ok(sock) = addr.parse::<SocketAddr>() {
        return Some(sock.ip());
    }
    if let Ok(ip) = addr.parse::<IpAddr>() {
        return Some(ip);
    }
    // "[::1]" without a port
    addr.strip_prefix('[')
        .and_then(|rest| rest.strip_suffix(']'))
        .and_then(|inner| inner.parse::<IpAddr>().ok())
}

/// Random room code over the unambiguous alphabet.
pub fn generate_room_code<R: Rng + ?Sized>(rng: &mut R) -> String {
    (0..ROOM_CODE_LEN)
        .map(|_| {
            let idx = rng.gen_range(0..ROOM_CODE_ALPHABET.len());
            ROOM_CODE_ALPHABET[idx] as char
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ipv4_groups_by_first_three_octets() {
        assert_eq!(auto_room_id("192.168.1.20"), "192.168.1");
        assert_eq!(auto_room_id("192.168.1.77:51234"), "192.168.1");
        assert_ne!(auto_room_id("192.168.2.20"), auto_room_id("192.168.1.20"));
    }

    #[test]
    fn test_ipv6_groups_by_prefix() {
        assert_eq!(
            auto_room_id("[fe80::1234:5678]:443"),
            "fe80:0000:0000:0000"
        );
        assert_eq!(auto_room_id("2001:db8:aa:bb::9"), "2001:0db8:00aa:00bb");
        assert_eq!(auto_room_id("[2001:db8::1]"), "2001:0db8:0000:0000");
    }

    #[test]
    fn test_ipv4_mapped_treated_as_v4() {
        assert_eq!(auto_room_id("[::ffff:10.0.0.5]:80"), "10.0.0");
    }

    #[test]
    fn test_unparseable_goes_to_default() {
        assert_eq!(auto_room_id("not-an-ip"), DEFAULT_AUTO_ROOM);
        assert_eq!(auto_room_id(""), DEFAULT_AUTO_ROOM);
    }

    #[test]
    fn test_room_code_alphabet() {
        let mut rng = rand::thread_rng();
        for _ in 0..200 {
            let code = generate_room_code(&mut rng);
            assert_eq!(code.len(), ROOM_CODE_LEN);
            assert!(code.bytes().all(|c| ROOM_CODE_ALPHABET.contains(&c)));
            assert!(!code.contains('0') && !code.contains('O') && !code.contains('I'));
        }
    }

    #[test]
    fn test_membership() {
        let mut room = Room::new("ABCDE", RoomKind::Coded);
        room.add("a");
        room.add("b");
        room.add("a");
        assert_eq!(room.others("").count(), 2);
        assert_eq!(room.others("a").collect::<Vec<_>>(), vec!["b"]);
        assert!(room.remove("a"));
        assert!(!room.remove("a"));
        room.remove("b");
        assert!(room.is_empty());
    }
}
