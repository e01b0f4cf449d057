//! Authentication ticket store
//!
//! Tickets are keyed by server address (or server id, or cluster id) and
//! user. User names are folded to lower case when the server is
//! case-insensitive.

use tracing::warn;

use super::auth_file::AuthStore;
use super::error::{StoreError, StoreResult};

/// A stored ticket
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthTicket {
    /// User the ticket was issued to
    pub user_name: String,
    /// Server address, id or cluster id
    pub server_address: String,
    /// Ticket value
    pub value: String,
}

/// How a connected server identifies itself for ticket lookups.
///
/// Resolved once per connection.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ServerIdentity {
    /// `host:port` the caller connected to
    pub host_port: String,
    /// Server id reported by the server, if any
    pub server_id: Option<String>,
    /// Cluster id when the server is a cluster member
    pub cluster_id: Option<String>,
    /// Whether user names compare case-insensitively
    pub case_insensitive: bool,
}

impl ServerIdentity {
    /// Identity for a plain `host:port` with no id
    pub fn new(host_port: impl Into<String>) -> Self {
        Self {
            host_port: host_port.into(),
            ..Self::default()
        }
    }

    /// Preferred key address: cluster id, then server id.
    pub fn primary_address(&self) -> Option<&str> {
        self.cluster_id
            .as_deref()
            .or(self.server_id.as_deref())
            .filter(|id| !id.trim().is_empty())
    }

    /// User name as it appears in ticket keys
    pub fn ticket_user(&self, user: &str) -> String {
        if self.case_insensitive {
            user.to_lowercase()
        } else {
            user.to_string()
        }
    }
}

/// Ticket store over a tickets file or memory.
#[derive(Debug)]
pub struct TicketStore {
    store: AuthStore,
}

impl TicketStore {
    /// Wrap a credential store
    pub fn new(store: AuthStore) -> Self {
        Self { store }
    }

    /// Underlying credential store
    pub fn store(&self) -> &AuthStore {
        &self.store
    }

    /// Ticket for `user` at `address`
    pub fn get_ticket(&self, user: &str, address: &str) -> StoreResult<Option<String>> {
        Ok(self.store.entry(user, address)?.map(|entry| entry.value))
    }

    /// Store a ticket; `None` or blank clears it
    pub fn save_ticket(&self, user: &str, address: &str, value: Option<&str>) -> StoreResult<()> {
        self.store.save(user, address, value)
    }

    /// All stored tickets
    pub fn list_tickets(&self) -> StoreResult<Vec<AuthTicket>> {
        Ok(self
            .store
            .entries()?
            .into_iter()
            .map(|entry| AuthTicket {
                user_name: entry.user_name,
                server_address: entry.server_address,
                value: entry.value,
            })
            .collect())
    }

    /// Ticket for `user` on a connected server: id first, then address.
    pub fn load_for(&self, server: &ServerIdentity, user: &str) -> StoreResult<Option<String>> {
        let user = server.ticket_user(user);
        if let Some(primary) = server.primary_address() {
            if let Some(ticket) = self.get_ticket(&user, primary)? {
                return Ok(Some(ticket));
            }
        }
        self.get_ticket(&user, &server.host_port)
    }

    /// Save (or clear) `user`'s ticket for a connected server.
    ///
    /// The id-keyed write comes first. The address-keyed write also runs when
    /// the server has no id or the ticket is being cleared, so stale entries
    /// under the address form are purged. Every attempt runs; any failure is
    /// returned as [`StoreError::Aggregate`] and successful writes are kept.
    pub fn save_for(&self, server: &ServerIdentity, user: &str, value: Option<&str>) -> StoreResult<()> {
        let user = server.ticket_user(user);
        let clearing = value.is_none_or(|v| v.trim().is_empty());
        let primary = server.primary_address();

        let mut addresses = Vec::with_capacity(2);
        if let Some(primary) = primary {
            addresses.push(primary);
        }
        if primary.is_none() || clearing {
            addresses.push(server.host_port.as_str());
        }

        let attempted = addresses.len();
        let failures: Vec<StoreError> = addresses
            .into_iter()
            .filter_map(|address| self.save_ticket(&user, address, value).err())
            .collect();

        if failures.is_empty() {
            return Ok(());
        }
        warn!(
            user = %user,
            attempted,
            failed = failures.len(),
            "ticket save partially failed"
        );
        Err(StoreError::Aggregate {
            attempted,
            failures,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn case_insensitive_servers_fold_users() {
        let tickets = TicketStore::new(AuthStore::memory());
        let server = ServerIdentity {
            case_insensitive: true,
            ..ServerIdentity::new("perforce:1666")
        };
        tickets.save_for(&server, "Alice", Some("T1")).unwrap();
        assert_eq!(tickets.get_ticket("alice", "perforce:1666").unwrap().as_deref(), Some("T1"));
        assert_eq!(tickets.load_for(&server, "ALICE").unwrap().as_deref(), Some("T1"));
    }

    #[test]
    fn server_id_is_preferred_and_address_only_on_clear() {
        let tickets = TicketStore::new(AuthStore::memory());
        let server = ServerIdentity {
            server_id: Some("master.1".into()),
            ..ServerIdentity::new("perforce:1666")
        };
        tickets.save_ticket("bob", "perforce:1666", Some("OLD")).unwrap();
        tickets.save_for(&server, "bob", Some("NEW")).unwrap();
        assert_eq!(tickets.get_ticket("bob", "master.1").unwrap().as_deref(), Some("NEW"));
        assert_eq!(tickets.get_ticket("bob", "perforce:1666").unwrap().as_deref(), Some("OLD"));
        assert_eq!(tickets.load_for(&server, "bob").unwrap().as_deref(), Some("NEW"));

        tickets.save_for(&server, "bob", None).unwrap();
        assert!(tickets.list_tickets().unwrap().is_empty());
    }

    #[test]
    fn cluster_id_wins_over_server_id() {
        let server = ServerIdentity {
            server_id: Some("edge".into()),
            cluster_id: Some("cluster".into()),
            ..ServerIdentity::new("h:1")
        };
        assert_eq!(server.primary_address(), Some("cluster"));
    }
}
