//! Container↔host UID/GID translation.
//!
//! In rootless mode the engine runs inside a user namespace where container
//! root maps to the invoking user. [`IdMappings`] holds the linear mapping
//! ranges (the same shape the kernel's `uid_map` uses) and translates ids in
//! both directions. The module also resolves user/group names against a
//! rootfs's own `/etc/passwd` and `/etc/group`, since names in an image refer
//! to the image's databases, not the host's.

use std::path::Path;

use rustix::process::{getegid, geteuid};

use crate::error::{Context, Error, Result};

/// One linear id mapping range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdMap {
    pub container_id: u32,
    pub host_id: u32,
    pub size: u32,
}

impl IdMap {
    fn to_host(&self, container: u32) -> Option<u32> {
        if container >= self.container_id && container - self.container_id < self.size {
            Some(self.host_id + (container - self.container_id))
        } else {
            None
        }
    }

    fn to_container(&self, host: u32) -> Option<u32> {
        if host >= self.host_id && host - self.host_id < self.size {
            Some(self.container_id + (host - self.host_id))
        } else {
            None
        }
    }
}

/// UID and GID mapping tables.
///
/// An empty table is the identity mapping (privileged mode).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdMappings {
    uids: Vec<IdMap>,
    gids: Vec<IdMap>,
}

impl IdMappings {
    /// The identity mapping: every id maps to itself.
    pub fn identity() -> Self {
        IdMappings::default()
    }

    /// The single-id rootless mapping: container root is the current
    /// effective uid/gid, nothing else is representable.
    pub fn rootless() -> Self {
        IdMappings {
            uids: vec![IdMap {
                container_id: 0,
                host_id: geteuid().as_raw(),
                size: 1,
            }],
            gids: vec![IdMap {
                container_id: 0,
                host_id: getegid().as_raw(),
                size: 1,
            }],
        }
    }

    pub fn new(uids: Vec<IdMap>, gids: Vec<IdMap>) -> Self {
        IdMappings { uids, gids }
    }

    /// True when the table is the identity mapping.
    pub fn is_identity(&self) -> bool {
        self.uids.is_empty() && self.gids.is_empty()
    }

    pub fn uid_to_host(&self, container: u32) -> Result<u32> {
        Self::translate(&self.uids, container, IdMap::to_host)
            .ok_or_else(|| Error::Conflict(format!("uid {container} is not mapped in this user namespace")))
    }

    pub fn gid_to_host(&self, container: u32) -> Result<u32> {
        Self::translate(&self.gids, container, IdMap::to_host)
            .ok_or_else(|| Error::Conflict(format!("gid {container} is not mapped in this user namespace")))
    }

    pub fn uid_to_container(&self, host: u32) -> Result<u32> {
        Self::translate(&self.uids, host, IdMap::to_container)
            .ok_or_else(|| Error::Conflict(format!("host uid {host} is not mapped in this user namespace")))
    }

    pub fn gid_to_container(&self, host: u32) -> Result<u32> {
        Self::translate(&self.gids, host, IdMap::to_container)
            .ok_or_else(|| Error::Conflict(format!("host gid {host} is not mapped in this user namespace")))
    }

    fn translate(maps: &[IdMap], id: u32, f: impl Fn(&IdMap, u32) -> Option<u32>) -> Option<u32> {
        if maps.is_empty() {
            return Some(id);
        }
        maps.iter().find_map(|m| f(m, id))
    }
}

/// Parse a numeric id, rejecting values that do not fit in a u32.
fn parse_id(s: &str) -> Result<u32> {
    s.parse()
        .map_err(|_| Error::invalid_input(format!("id {s:?} is not a valid uid/gid")))
}

/// Resolve `name_or_uid` against `<rootfs>/etc/passwd`.
///
/// Returns the `(uid, gid)` pair of the matching entry. A numeric input is
/// returned as-is with gid 0 if no passwd entry matches it.
pub fn lookup_user(rootfs: &Path, name_or_uid: &str) -> Result<(u32, u32)> {
    let passwd = rootfs.join("etc/passwd");
    let content = match std::fs::read_to_string(&passwd) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(e) => return Err(e).with_ctx(|| format!("read {}", passwd.display())),
    };

    for line in content.lines() {
        // name:passwd:uid:gid:gecos:home:shell
        let mut fields = line.split(':');
        let (Some(name), _, Some(uid), Some(gid)) =
            (fields.next(), fields.next(), fields.next(), fields.next())
        else {
            continue;
        };
        if name == name_or_uid || uid == name_or_uid {
            return Ok((parse_id(uid)?, parse_id(gid)?));
        }
    }

    if name_or_uid.bytes().all(|b| b.is_ascii_digit()) {
        return Ok((parse_id(name_or_uid)?, 0));
    }
    Err(Error::not_found(format!("user {name_or_uid:?} in rootfs /etc/passwd")))
}

/// Resolve `name_or_gid` against `<rootfs>/etc/group`.
pub fn lookup_group(rootfs: &Path, name_or_gid: &str) -> Result<u32> {
    let group = rootfs.join("etc/group");
    let content = match std::fs::read_to_string(&group) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(e) => return Err(e).with_ctx(|| format!("read {}", group.display())),
    };

    for line in content.lines() {
        // name:passwd:gid:members
        let mut fields = line.split(':');
        let (Some(name), _, Some(gid)) = (fields.next(), fields.next(), fields.next()) else {
            continue;
        };
        if name == name_or_gid || gid == name_or_gid {
            return Ok(parse_id(gid)?);
        }
    }

    if name_or_gid.bytes().all(|b| b.is_ascii_digit()) {
        return Ok(parse_id(name_or_gid)?);
    }
    Err(Error::not_found(format!("group {name_or_gid:?} in rootfs /etc/group")))
}

/// Resolve a `user[:group]` spec against a rootfs.
pub fn resolve_user_spec(rootfs: &Path, spec: &str) -> Result<(u32, u32)> {
    match spec.split_once(':') {
        Some((user, group)) => {
            let (uid, _) = lookup_user(rootfs, user)?;
            let gid = lookup_group(rootfs, group)?;
            Ok((uid, gid))
        }
        None => lookup_user(rootfs, spec),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn single_map() -> IdMappings {
        IdMappings::new(
            vec![IdMap {
                container_id: 0,
                host_id: 1000,
                size: 1,
            }],
            vec![IdMap {
                container_id: 0,
                host_id: 1000,
                size: 1,
            }],
        )
    }

    #[test]
    fn test_identity() {
        let map = IdMappings::identity();
        assert!(map.is_identity());
        assert_eq!(map.uid_to_host(1234).unwrap(), 1234);
        assert_eq!(map.gid_to_container(0).unwrap(), 0);
    }

    #[test]
    fn test_single_mapping() {
        let map = single_map();
        assert_eq!(map.uid_to_host(0).unwrap(), 1000);
        assert_eq!(map.uid_to_container(1000).unwrap(), 0);
        // uid 1 is outside the size-1 range
        assert_eq!(map.uid_to_host(1).unwrap_err().kind(), ErrorKind::Conflict);
        assert_eq!(map.uid_to_container(0).unwrap_err().kind(), ErrorKind::Conflict);
    }

    #[test]
    fn test_range_mapping() {
        let map = IdMappings::new(
            vec![IdMap {
                container_id: 0,
                host_id: 100000,
                size: 65536,
            }],
            vec![],
        );
        assert_eq!(map.uid_to_host(0).unwrap(), 100000);
        assert_eq!(map.uid_to_host(65535).unwrap(), 165535);
        assert!(map.uid_to_host(65536).is_err());
        assert_eq!(map.uid_to_container(100001).unwrap(), 1);
        // empty gid table stays identity
        assert_eq!(map.gid_to_host(7).unwrap(), 7);
    }

    #[test]
    fn test_lookup_user() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("etc")).unwrap();
        std::fs::write(
            dir.path().join("etc/passwd"),
            "root:x:0:0:root:/root:/bin/sh\nweb:x:33:34:www:/var/www:/sbin/nologin\n",
        )
        .unwrap();
        std::fs::write(dir.path().join("etc/group"), "root:x:0:\nwww-data:x:34:web\n").unwrap();

        assert_eq!(lookup_user(dir.path(), "web").unwrap(), (33, 34));
        assert_eq!(lookup_user(dir.path(), "33").unwrap(), (33, 34));
        assert_eq!(lookup_group(dir.path(), "www-data").unwrap(), 34);
        assert_eq!(resolve_user_spec(dir.path(), "web:root").unwrap(), (33, 0));
        assert_eq!(
            lookup_user(dir.path(), "nobody").unwrap_err().kind(),
            ErrorKind::NotFound
        );
    }

    #[test]
    fn test_lookup_numeric_without_passwd() {
        let dir = tempfile::tempdir().unwrap();
        // no /etc at all: numeric ids pass through, names fail
        assert_eq!(lookup_user(dir.path(), "42").unwrap(), (42, 0));
        assert!(lookup_user(dir.path(), "alice").is_err());
        // id too large for u32
        assert_eq!(
            lookup_user(dir.path(), "99999999999").unwrap_err().kind(),
            ErrorKind::InvalidInput
        );
    }
}
