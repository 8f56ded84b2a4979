//! Remote database abstraction for the sync mirror.
//!
//! A remote database is account scoped and split into a private and a
//! shared database (selected by `StoreScope`). Each database holds zones;
//! each zone holds records and optionally a share describing who may read
//! it.

use super::MirrorResult;
use crate::model::entity::{Attributes, EntityId, Record};
use crate::model::predicate::Predicate;
use crate::store::StoreScope;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

/// Zone that mirrored records are written to when they have none yet.
pub const MIRROR_ZONE_NAME: &str = "stfoundation.mirror.zone";

/// Zone identity: a name unique per owning account.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ZoneId {
    pub name: String,
    pub owner: String,
}

impl ZoneId {
    pub fn new(name: impl Into<String>, owner: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            owner: owner.into(),
        }
    }

    /// The mirror zone owned by `owner`.
    pub fn mirror(owner: impl Into<String>) -> Self {
        Self::new(MIRROR_ZONE_NAME, owner)
    }

    /// Compact `<owner>:<name>` form persisted with local records.
    pub fn key(&self) -> String {
        format!("{}:{}", self.owner, self.name)
    }

    pub fn parse_key(key: &str) -> Option<Self> {
        let (owner, name) = key.split_once(':')?;
        if owner.is_empty() || name.is_empty() {
            return None;
        }
        Some(Self::new(name, owner))
    }
}

impl Display for ZoneId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.key())
    }
}

/// One record as stored remotely.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteRecord {
    pub record_type: String,
    pub id: EntityId,
    pub zone: ZoneId,
    pub attributes: Attributes,
    /// Local version at push time.
    pub version: i64,
    /// Server change tag assigned on save.
    #[serde(default)]
    pub change_tag: u64,
}

impl RemoteRecord {
    pub fn from_record(record: &Record, zone: ZoneId) -> Self {
        Self {
            record_type: record.entity.clone(),
            id: record.id,
            zone,
            attributes: record.attributes.clone(),
            version: record.version,
            change_tag: 0,
        }
    }

    pub fn into_record(self) -> Record {
        let zone = self.zone.key();
        Record {
            entity: self.record_type,
            id: self.id,
            attributes: self.attributes,
            version: self.version,
            zone: Some(zone),
        }
    }
}

/// Record-type scoped query evaluated by the remote database.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteQuery {
    pub record_type: String,
    pub predicate: Predicate,
}

impl RemoteQuery {
    pub fn new(record_type: impl Into<String>, predicate: Predicate) -> Self {
        Self {
            record_type: record_type.into(),
            predicate,
        }
    }

    pub fn matches(&self, record: &RemoteRecord) -> bool {
        record.record_type == self.record_type && self.predicate.matches(record.id, &record.attributes)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantRole {
    Owner,
    PrivateUser,
    PublicUser,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub user: String,
    pub role: ParticipantRole,
}

/// Participants of a shared zone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Share {
    pub zone: ZoneId,
    pub participants: Vec<Participant>,
}

impl Share {
    /// A share of `zone` whose only participant is its owner.
    pub fn new(zone: ZoneId) -> Self {
        let owner = Participant {
            user: zone.owner.clone(),
            role: ParticipantRole::Owner,
        };
        Self {
            zone,
            participants: vec![owner],
        }
    }

    pub fn with_participant(mut self, user: impl Into<String>, role: ParticipantRole) -> Self {
        self.participants.push(Participant {
            user: user.into(),
            role,
        });
        self
    }

    /// The participant entry with the owner role.
    pub fn owner(&self) -> Option<&Participant> {
        self.participants
            .iter()
            .find(|participant| participant.role == ParticipantRole::Owner)
    }
}

/// Changes in one zone since a previous change token.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ZoneChanges {
    pub changed: Vec<RemoteRecord>,
    pub deleted: Vec<(String, EntityId)>,
    /// Token to pass on the next fetch.
    pub token: u64,
}

/// Account-scoped remote database.
#[async_trait]
pub trait RemoteDatabase: Send + Sync {
    /// Identifier of the remote container this database belongs to.
    fn container_id(&self) -> &str;

    /// Whether account credentials are available on this device.
    async fn has_account(&self) -> MirrorResult<bool>;

    /// Identifier of the signed-in account.
    async fn current_user(&self) -> MirrorResult<String>;

    async fn all_zones(&self, scope: StoreScope) -> MirrorResult<Vec<ZoneId>>;

    /// Deletes a zone with all records and its share.
    async fn delete_zone(&self, scope: StoreScope, zone: &ZoneId) -> MirrorResult<()>;

    /// Runs `query` across every zone of the database.
    async fn query(&self, scope: StoreScope, query: &RemoteQuery) -> MirrorResult<Vec<RemoteRecord>>;

    /// Saves records, creating missing zones. Returns the saved records
    /// with their new change tags.
    async fn save(&self, scope: StoreScope, records: Vec<RemoteRecord>) -> MirrorResult<Vec<RemoteRecord>>;

    /// Deletes records from one zone; ids that do not exist are ignored.
    async fn delete_records(
        &self,
        scope: StoreScope,
        zone: &ZoneId,
        records: &[(String, EntityId)],
    ) -> MirrorResult<usize>;

    async fn fetch_share(&self, scope: StoreScope, zone: &ZoneId) -> MirrorResult<Option<Share>>;

    /// Changes in `zone` after `since`; everything when `since` is `None`.
    async fn fetch_zone_changes(
        &self,
        scope: StoreScope,
        zone: &ZoneId,
        since: Option<u64>,
    ) -> MirrorResult<ZoneChanges>;
}

#[cfg(test)]
mod tests {
    use super::{ParticipantRole, Share, ZoneId, MIRROR_ZONE_NAME};

    #[test]
    fn zone_keys_round_trip() {
        let zone = ZoneId::mirror("alice");
        assert_eq!(zone.key(), format!("alice:{MIRROR_ZONE_NAME}"));
        assert_eq!(ZoneId::parse_key(&zone.key()), Some(zone));
        assert_eq!(ZoneId::parse_key("no-separator"), None);
        assert_eq!(ZoneId::parse_key(":name"), None);
    }

    #[test]
    fn share_owner_is_the_owner_role() {
        let share = Share::new(ZoneId::new("trip", "alice"))
            .with_participant("bob", ParticipantRole::PrivateUser);
        assert_eq!(share.owner().map(|owner| owner.user.as_str()), Some("alice"));
        assert_eq!(share.participants.len(), 2);
    }
}
