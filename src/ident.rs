use anyhow::{anyhow, Result};
use nix::unistd::{Gid, Group, Uid, User};

/// Resolves a user given by name or numeric id. Database lookup wins; a
/// purely numeric string that matches no account is taken as a raw id.
pub fn resolve_uid(user: &str) -> Result<Uid> {
    if let Some(entry) = User::from_name(user)? {
        return Ok(entry.uid);
    }
    user.parse::<u32>()
        .map(Uid::from_raw)
        .map_err(|_| anyhow!("unknown user {:?}", user))
}

/// Resolves a group given by name or numeric id.
pub fn resolve_gid(group: &str) -> Result<Gid> {
    if let Some(entry) = Group::from_name(group)? {
        return Ok(entry.gid);
    }
    group
        .parse::<u32>()
        .map(Gid::from_raw)
        .map_err(|_| anyhow!("unknown group {:?}", group))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_fallback() {
        assert_eq!(resolve_uid("12345").unwrap(), Uid::from_raw(12345));
        assert_eq!(resolve_gid("54321").unwrap(), Gid::from_raw(54321));
    }

    #[test]
    fn root_resolves_by_name() {
        assert_eq!(resolve_uid("root").unwrap(), Uid::from_raw(0));
        assert_eq!(resolve_gid("root").unwrap(), Gid::from_raw(0));
    }

    #[test]
    fn garbage_rejected() {
        assert!(resolve_uid("no-such-user-xyz").is_err());
        assert!(resolve_gid("no-such-group-xyz").is_err());
    }
}
