//! Peer registry
//!
//! The registry is the single authority for name, address and public key
//! uniqueness. Every mutation takes the database lock and runs inside an
//! immediate transaction, so allocate-and-insert is one atomic unit: two
//! enrollments can never both observe the same free address.

use crate::allocator::AddressPool;
use crate::db::{constraint_violation, Constraint, Database};
use crate::keys::PublicKey;
use crate::name::{validate_name, DeviceName};
use crate::policy::SafeNetPolicy;
use crate::types::Peer;
use crate::{Error, Result};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::collections::{BTreeMap, HashSet};
use std::net::Ipv4Addr;
use tracing::{debug, info};
use uuid::Uuid;

/// Durable store of enrolled peers
#[derive(Clone)]
pub struct PeerRegistry {
    db: Database,
    pool: AddressPool,
}

impl PeerRegistry {
    pub fn new(db: Database, pool: AddressPool) -> Self {
        Self { db, pool }
    }

    pub fn pool(&self) -> &AddressPool {
        &self.pool
    }

    /// Insert a peer at a caller-chosen address
    pub fn add_peer(
        &self,
        name: &DeviceName,
        public_key: &PublicKey,
        address: Ipv4Addr,
    ) -> Result<Peer> {
        if !self.pool.is_assignable(address) {
            return Err(Error::InvalidConfig(format!(
                "Address {} is not assignable in {}",
                address, self.pool
            )));
        }

        let conn = self.db.connection();
        let mut conn = conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let peer = Peer::new(name.clone(), public_key.clone(), address);
        insert_peer(&tx, &peer)?;
        let peer = with_groups(&tx, peer)?;
        tx.commit()?;

        info!("Added peer {} at {}", peer.name, peer.address);
        Ok(peer)
    }

    /// Allocate the lowest free address and insert the peer in one step
    pub fn enroll(&self, name: &DeviceName, public_key: &PublicKey) -> Result<Peer> {
        let conn = self.db.connection();
        let mut conn = conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        if find_peer(&tx, name.as_str())?.is_some() {
            return Err(Error::DuplicateName {
                name: name.to_string(),
            });
        }

        let existing = load_addresses(&tx)?;
        let address = self.pool.next_address(&existing)?;
        let peer = Peer::new(name.clone(), public_key.clone(), address);
        insert_peer(&tx, &peer)?;
        let peer = with_groups(&tx, peer)?;
        tx.commit()?;

        info!("Enrolled peer {} at {}", peer.name, peer.address);
        Ok(peer)
    }

    /// Look up a peer by name
    pub fn get_peer(&self, name: &str) -> Result<Peer> {
        let conn = self.db.connection();
        let conn = conn.lock();
        let peer = find_peer(&conn, name)?.ok_or_else(|| not_found(name))?;
        with_groups(&conn, peer)
    }

    /// All peers in enrollment order
    pub fn list_peers(&self) -> Result<Vec<Peer>> {
        let conn = self.db.connection();
        let conn = conn.lock();

        let mut stmt = conn.prepare(
            "SELECT id, name, public_key, address, created_at FROM peers ORDER BY rowid",
        )?;
        let rows = stmt.query_map([], RawPeer::from_row)?;

        let mut memberships = load_memberships(&conn)?;
        let mut peers = Vec::new();
        for row in rows {
            let mut peer = row?.parse()?;
            peer.groups = memberships.remove(peer.name.as_str()).unwrap_or_default();
            peers.push(peer);
        }
        Ok(peers)
    }

    /// Remove a peer; its address is free for the next enrollment
    pub fn delete_peer(&self, name: &str) -> Result<()> {
        let conn = self.db.connection();
        let conn = conn.lock();
        let rows = conn.execute("DELETE FROM peers WHERE name = ?1", params![name])?;
        if rows == 0 {
            return Err(not_found(name));
        }
        info!("Deleted peer {}", name);
        Ok(())
    }

    /// Addresses currently held by peers
    pub fn addresses(&self) -> Result<HashSet<Ipv4Addr>> {
        let conn = self.db.connection();
        let conn = conn.lock();
        load_addresses(&conn)
    }

    /// Replace declared groups and memberships with those of `policy`
    pub fn apply_policy(&self, policy: &SafeNetPolicy) -> Result<()> {
        let conn = self.db.connection();
        let mut conn = conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        // Cascades to device_groups
        tx.execute("DELETE FROM groups", [])?;
        for label in policy.groups() {
            tx.execute("INSERT INTO groups (label) VALUES (?1)", params![label])?;
        }
        for device in policy.devices() {
            for label in &device.groups {
                insert_membership(&tx, device.name.as_str(), label)?;
            }
        }
        tx.commit()?;

        info!(
            "Applied policy: {} devices, {} rules",
            policy.devices().len(),
            policy.access_rules().len()
        );
        Ok(())
    }

    /// Replace one device's memberships; every group must already be declared
    pub fn assign_groups(&self, device: &DeviceName, groups: &[String]) -> Result<()> {
        let conn = self.db.connection();
        let mut conn = conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        tx.execute(
            "DELETE FROM device_groups WHERE device_name = ?1",
            params![device.as_str()],
        )?;
        for label in groups {
            insert_membership(&tx, device.as_str(), label)?;
        }
        tx.commit()?;

        debug!("Assigned {} to {:?}", device, groups);
        Ok(())
    }

    /// Groups declared by the last applied policy
    pub fn declared_groups(&self) -> Result<Vec<String>> {
        let conn = self.db.connection();
        let conn = conn.lock();
        let mut stmt = conn.prepare("SELECT label FROM groups ORDER BY label")?;
        let labels = stmt
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(labels)
    }
}

fn not_found(name: &str) -> Error {
    Error::NotFound {
        kind: "peer".to_string(),
        id: name.to_string(),
    }
}

fn insert_peer(conn: &Connection, peer: &Peer) -> Result<()> {
    conn.execute(
        "INSERT INTO peers (id, name, public_key, address, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            peer.id.to_string(),
            peer.name.as_str(),
            peer.public_key.as_str(),
            peer.address.to_string(),
            peer.created_at,
        ],
    )
    .map_err(|e| match constraint_violation(&e) {
        Some(Constraint::Unique(column)) if column == "peers.name" => Error::DuplicateName {
            name: peer.name.to_string(),
        },
        Some(Constraint::Unique(column)) if column == "peers.address" => Error::DuplicateAddress {
            address: peer.address.to_string(),
        },
        Some(Constraint::Unique(column)) if column == "peers.public_key" => Error::AlreadyExists {
            kind: "public key".to_string(),
            id: peer.public_key.to_string(),
        },
        _ => Error::Database(e),
    })?;
    debug!("Inserted peer {} ({})", peer.name, peer.id);
    Ok(())
}

fn insert_membership(conn: &Connection, device: &str, label: &str) -> Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO device_groups (device_name, group_label) VALUES (?1, ?2)",
        params![device, label],
    )
    .map_err(|e| match constraint_violation(&e) {
        Some(Constraint::ForeignKey) => Error::UnknownGroup {
            group: label.to_string(),
        },
        _ => Error::Database(e),
    })?;
    Ok(())
}

fn find_peer(conn: &Connection, name: &str) -> Result<Option<Peer>> {
    let raw = conn
        .query_row(
            "SELECT id, name, public_key, address, created_at FROM peers WHERE name = ?1",
            params![name],
            RawPeer::from_row,
        )
        .optional()?;
    raw.map(RawPeer::parse).transpose()
}

fn with_groups(conn: &Connection, mut peer: Peer) -> Result<Peer> {
    let mut stmt = conn.prepare(
        "SELECT group_label FROM device_groups WHERE device_name = ?1 ORDER BY group_label",
    )?;
    peer.groups = stmt
        .query_map(params![peer.name.as_str()], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<String>>>()?;
    Ok(peer)
}

fn load_memberships(conn: &Connection) -> Result<BTreeMap<String, Vec<String>>> {
    let mut stmt = conn.prepare(
        "SELECT device_name, group_label FROM device_groups ORDER BY device_name, group_label",
    )?;
    let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?;

    let mut memberships: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for row in rows {
        let (device, label) = row?;
        memberships.entry(device).or_default().push(label);
    }
    Ok(memberships)
}

fn load_addresses(conn: &Connection) -> Result<HashSet<Ipv4Addr>> {
    let mut stmt = conn.prepare("SELECT address FROM peers")?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

    let mut addresses = HashSet::new();
    for row in rows {
        let raw = row?;
        let address = raw
            .parse()
            .map_err(|_| Error::Internal(format!("Corrupt address in registry: {:?}", raw)))?;
        addresses.insert(address);
    }
    Ok(addresses)
}

/// Raw database row before parsing
struct RawPeer {
    id: String,
    name: String,
    public_key: String,
    address: String,
    created_at: i64,
}

impl RawPeer {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            public_key: row.get(2)?,
            address: row.get(3)?,
            created_at: row.get(4)?,
        })
    }

    fn parse(self) -> Result<Peer> {
        let corrupt = |field: &str, value: &str| {
            Error::Internal(format!("Corrupt {} in registry: {:?}", field, value))
        };
        Ok(Peer {
            id: Uuid::parse_str(&self.id).map_err(|_| corrupt("id", &self.id))?,
            name: validate_name(&self.name)?,
            public_key: PublicKey::parse(&self.public_key)?,
            address: self
                .address
                .parse()
                .map_err(|_| corrupt("address", &self.address))?,
            groups: Vec::new(),
            created_at: self.created_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::generate_wireguard_keypair;
    use crate::policy::parse_policy;

    fn registry() -> PeerRegistry {
        PeerRegistry::new(
            Database::open_memory().unwrap(),
            AddressPool::parse("10.8.0.0/24").unwrap(),
        )
    }

    fn name(s: &str) -> DeviceName {
        validate_name(s).unwrap()
    }

    fn key() -> PublicKey {
        generate_wireguard_keypair().public_key
    }

    #[test]
    fn test_enroll_assigns_lowest_host() {
        let reg = registry();
        let peer = reg.enroll(&name("laptop-01"), &key()).unwrap();
        assert_eq!(peer.address, Ipv4Addr::new(10, 8, 0, 2));

        let second = reg.enroll(&name("phone-01"), &key()).unwrap();
        assert_eq!(second.address, Ipv4Addr::new(10, 8, 0, 3));
    }

    #[test]
    fn test_duplicate_name_leaves_registry_unchanged() {
        let reg = registry();
        reg.enroll(&name("laptop-01"), &key()).unwrap();
        let before = reg.list_peers().unwrap();

        let err = reg.enroll(&name("laptop-01"), &key()).unwrap_err();
        assert!(matches!(err, Error::DuplicateName { .. }));

        let err = reg
            .add_peer(&name("laptop-01"), &key(), Ipv4Addr::new(10, 8, 0, 9))
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateName { .. }));

        assert_eq!(reg.list_peers().unwrap(), before);
    }

    #[test]
    fn test_duplicate_address_and_key() {
        let reg = registry();
        let pk = key();
        reg.add_peer(&name("laptop-01"), &pk, Ipv4Addr::new(10, 8, 0, 5))
            .unwrap();

        let err = reg
            .add_peer(&name("phone-01"), &key(), Ipv4Addr::new(10, 8, 0, 5))
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateAddress { .. }));

        let err = reg.enroll(&name("phone-01"), &pk).unwrap_err();
        assert!(matches!(err, Error::AlreadyExists { .. }));
        assert_eq!(reg.list_peers().unwrap().len(), 1);
    }

    #[test]
    fn test_add_peer_outside_pool_rejected() {
        let reg = registry();
        for address in [Ipv4Addr::new(10, 8, 0, 1), Ipv4Addr::new(10, 9, 0, 2)] {
            assert!(reg.add_peer(&name("laptop-01"), &key(), address).is_err());
        }
    }

    #[test]
    fn test_distinct_names_get_distinct_addresses() {
        let reg = registry();
        for i in 0..20 {
            reg.enroll(&name(&format!("device-{:02}", i)), &key()).unwrap();
        }
        let peers = reg.list_peers().unwrap();
        assert_eq!(peers.len(), 20);
        let unique: HashSet<_> = peers.iter().map(|p| p.address).collect();
        assert_eq!(unique.len(), 20);
        assert_eq!(peers[0].name.as_str(), "device-00");
        assert_eq!(peers[19].name.as_str(), "device-19");
    }

    #[test]
    fn test_delete_frees_address() {
        let reg = registry();
        reg.enroll(&name("laptop-01"), &key()).unwrap();
        reg.enroll(&name("laptop-02"), &key()).unwrap();
        reg.delete_peer("laptop-01").unwrap();

        let peer = reg.enroll(&name("laptop-03"), &key()).unwrap();
        assert_eq!(peer.address, Ipv4Addr::new(10, 8, 0, 2));
    }

    #[test]
    fn test_missing_peer() {
        let reg = registry();
        assert!(matches!(reg.get_peer("ghost"), Err(Error::NotFound { .. })));
        assert!(matches!(reg.delete_peer("ghost"), Err(Error::NotFound { .. })));
    }

    #[test]
    fn test_exhausted_pool() {
        let reg = PeerRegistry::new(
            Database::open_memory().unwrap(),
            AddressPool::parse("10.8.0.0/30").unwrap(),
        );
        reg.enroll(&name("only-one"), &key()).unwrap();
        let err = reg.enroll(&name("one-more"), &key()).unwrap_err();
        assert!(matches!(err, Error::Exhausted { .. }));
        assert_eq!(reg.list_peers().unwrap().len(), 1);
    }

    #[test]
    fn test_concurrent_enrollment_never_shares_address() {
        let reg = registry();
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let reg = reg.clone();
                std::thread::spawn(move || reg.enroll(&name(&format!("node-{}", i)), &key()))
            })
            .collect();
        for handle in handles {
            handle.join().unwrap().unwrap();
        }
        let addresses = reg.addresses().unwrap();
        assert_eq!(addresses.len(), 8);
    }

    #[test]
    fn test_policy_groups_attach_to_peers() {
        let reg = registry();
        let policy = parse_policy(
            r#"
devices:
  - name: laptop-01
    groups: [staff, admins]
  - name: nas-01
    groups: [servers]
access_rules:
  - { from: staff, to: servers, action: allow }
"#,
        )
        .unwrap();
        reg.apply_policy(&policy).unwrap();
        reg.enroll(&name("laptop-01"), &key()).unwrap();

        let peer = reg.get_peer("laptop-01").unwrap();
        assert_eq!(peer.groups, vec!["admins", "staff"]);
        assert_eq!(reg.declared_groups().unwrap(), vec!["admins", "servers", "staff"]);

        // Re-applying replaces rather than merges
        let policy = parse_policy("devices:\n  - name: laptop-01\n    groups: [guests]\n").unwrap();
        reg.apply_policy(&policy).unwrap();
        let peers = reg.list_peers().unwrap();
        assert_eq!(peers[0].groups, vec!["guests"]);
    }

    #[test]
    fn test_unknown_group_rejected() {
        let reg = registry();
        let err = reg
            .assign_groups(&name("laptop-01"), &["ghost".to_string()])
            .unwrap_err();
        assert!(matches!(err, Error::UnknownGroup { group } if group == "ghost"));
    }
}
