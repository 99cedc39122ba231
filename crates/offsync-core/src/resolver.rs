//! Conflict resolution policy.
//!
//! Pure functions, no I/O. Given what the client pushed and what the server
//! holds, decide which value becomes canonical:
//!
//! 1. A push made against the server's current version is accepted as is.
//! 2. A tombstone on either side beats a concurrent update, whatever the
//!    timestamps say. When both sides deleted, the server's copy is kept.
//! 3. Otherwise the strictly later `updated_at` wins and the server wins
//!    exact ties.
//!
//! A local win means re-pushing against the newer server version. That is
//! allowed once; a second stale push is flagged for a human instead.

use crate::models::Record;

/// Number of automatic re-pushes allowed per entry
pub const MAX_REPUSHES: u32 = 1;

/// Outcome of comparing a local mutation with the server's record
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Local value is canonical; push it (again) against the server version
    Accept,
    /// Server value is canonical; replace the local record with it
    Overwrite(Record),
    /// Automatic resolution gave up
    Flag { local: Record, server: Record },
}

/// Decide between a local record pushed against `base_version` and the
/// server's current record.
pub fn resolve(local: &Record, base_version: i64, server: &Record) -> Decision {
    if base_version == server.version {
        return Decision::Accept;
    }

    match (local.deleted, server.deleted) {
        (true, false) => return Decision::Accept,
        (_, true) => return Decision::Overwrite(server.clone()),
        (false, false) => {}
    }

    if local.updated_at > server.updated_at {
        Decision::Accept
    } else {
        Decision::Overwrite(server.clone())
    }
}

/// Turn a local win into a flag once the entry used up its re-pushes.
pub fn escalate(decision: Decision, repush_count: u32, local: &Record, server: &Record) -> Decision {
    match decision {
        Decision::Accept if repush_count >= MAX_REPUSHES => Decision::Flag {
            local: local.clone(),
            server: server.clone(),
        },
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn pair(local_at: i64, server_at: i64) -> (Record, Record) {
        let mut local = Record::new(json!({"side": "local"}), "device-a", local_at);
        local.version = 3;
        let mut server = local.clone();
        server.version = 4;
        server.updated_at = server_at;
        server.origin_id = "device-b".into();
        server.payload = json!({"side": "server"});
        (local, server)
    }

    #[test]
    fn current_base_is_accepted_regardless_of_time() {
        let (local, server) = pair(1, 100);
        assert_eq!(resolve(&local, 4, &server), Decision::Accept);
    }

    #[test]
    fn later_server_wins() {
        let (local, server) = pair(100, 200);
        assert_eq!(
            resolve(&local, 3, &server),
            Decision::Overwrite(server.clone())
        );
    }

    #[test]
    fn later_local_wins() {
        let (local, server) = pair(300, 200);
        assert_eq!(resolve(&local, 3, &server), Decision::Accept);
    }

    #[test]
    fn exact_tie_goes_to_server() {
        let (local, server) = pair(200, 200);
        assert_eq!(
            resolve(&local, 3, &server),
            Decision::Overwrite(server.clone())
        );
    }

    #[test]
    fn local_delete_beats_later_server_update() {
        let (mut local, server) = pair(100, 900);
        local.deleted = true;
        assert_eq!(resolve(&local, 3, &server), Decision::Accept);
    }

    #[test]
    fn server_delete_beats_later_local_update() {
        let (local, mut server) = pair(900, 100);
        server.deleted = true;
        assert_eq!(
            resolve(&local, 3, &server),
            Decision::Overwrite(server.clone())
        );
    }

    #[test]
    fn both_deleted_keeps_server_copy() {
        let (mut local, mut server) = pair(900, 100);
        local.deleted = true;
        server.deleted = true;
        assert_eq!(
            resolve(&local, 3, &server),
            Decision::Overwrite(server.clone())
        );
    }

    #[test]
    fn resolve_is_deterministic() {
        let (local, server) = pair(150, 151);
        let first = resolve(&local, 3, &server);
        for _ in 0..10 {
            assert_eq!(resolve(&local, 3, &server), first);
        }
    }

    #[test]
    fn second_stale_accept_is_flagged() {
        let (local, server) = pair(300, 200);
        assert_eq!(
            escalate(Decision::Accept, 0, &local, &server),
            Decision::Accept
        );
        assert_eq!(
            escalate(Decision::Accept, 1, &local, &server),
            Decision::Flag {
                local: local.clone(),
                server: server.clone()
            }
        );
        assert_eq!(
            escalate(Decision::Overwrite(server.clone()), 1, &local, &server),
            Decision::Overwrite(server.clone())
        );
    }
}
