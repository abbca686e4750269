//! Record types carried inside tribe notifications.
//!
//! Every record serializes to a flat JSON object whose field names match the
//! names browser clients already consume (`SenderName`, `EntityID`, ...).

use serde::{Deserialize, Serialize};

/// Known body layouts, keyed by the envelope discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "i32", try_from = "i32")]
#[repr(i32)]
pub enum Discriminant {
    Chat = 1,
    EntityUpdate = 2,
    PresenceUpdate = 3,
}

impl Discriminant {
    /// Variant name used in logs and decode errors.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Discriminant::Chat => "Chat",
            Discriminant::EntityUpdate => "EntityUpdate",
            Discriminant::PresenceUpdate => "PresenceUpdate",
        }
    }
}

impl From<Discriminant> for i32 {
    fn from(d: Discriminant) -> i32 {
        d as i32
    }
}

impl TryFrom<i32> for Discriminant {
    type Error = i32;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Discriminant::Chat),
            2 => Ok(Discriminant::EntityUpdate),
            3 => Ok(Discriminant::PresenceUpdate),
            other => Err(other),
        }
    }
}

/// A chat line sent to the tribe channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Chat {
    pub sender_name: String,
    pub sender_steam_name: String,
    pub sender_tribe_name: String,
    #[serde(rename = "SenderID")]
    pub sender_id: u32,
    pub message: String,
    pub sender_team_index: i32,
    pub send_mode: String,
    #[serde(rename = "UserID")]
    pub user_id: String,
    pub use_admin_icon: bool,
    pub is_tribe_owner: bool,
    pub player_badge_group: i32,
}

/// A tribe-owned entity (ship, bed, ...) appeared, moved or changed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct EntityUpdate {
    #[serde(rename = "EntityID")]
    pub entity_id: u32,
    #[serde(rename = "ParentEntityID")]
    pub parent_entity_id: u32,
    pub entity_type: String,
    pub ship_type: String,
    pub entity_name: String,
    #[serde(rename = "ServerID")]
    pub server_id: u32,
    pub x: f32,
    pub y: f32,
    pub is_dead: bool,
    pub is_new_entity: bool,
    pub is_just_location_change: bool,
}

impl EntityUpdate {
    /// Grid coordinates of the server the entity is on.
    #[must_use]
    pub fn server_grid(&self) -> [u16; 2] {
        crate::envelope::unpack_server_id(self.server_id)
    }
}

/// A tribe member came online or went offline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PresenceUpdate {
    #[serde(rename = "PlayerID")]
    pub player_id: u32,
    /// Epoch seconds.
    pub last_online_at: i32,
}

/// A decoded record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Record {
    Chat(Chat),
    EntityUpdate(EntityUpdate),
    PresenceUpdate(PresenceUpdate),
}

impl Record {
    /// The discriminant this record is encoded under.
    #[must_use]
    pub fn discriminant(&self) -> Discriminant {
        match self {
            Record::Chat(_) => Discriminant::Chat,
            Record::EntityUpdate(_) => Discriminant::EntityUpdate,
            Record::PresenceUpdate(_) => Discriminant::PresenceUpdate,
        }
    }

    /// Variant name.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.discriminant().name()
    }

    /// Serialize the record to its flat JSON form.
    ///
    /// # Errors
    ///
    /// Returns an error if the entity location is NaN or infinite, which
    /// JSON cannot represent.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        if let Record::EntityUpdate(update) = self {
            if !(update.x.is_finite() && update.y.is_finite()) {
                return Err(serde::ser::Error::custom(format!(
                    "non-finite location ({}, {}) for entity {}",
                    update.x, update.y, update.entity_id
                )));
            }
        }
        serde_json::to_string(self)
    }
}

impl From<Chat> for Record {
    fn from(chat: Chat) -> Self {
        Record::Chat(chat)
    }
}

impl From<EntityUpdate> for Record {
    fn from(update: EntityUpdate) -> Self {
        Record::EntityUpdate(update)
    }
}

impl From<PresenceUpdate> for Record {
    fn from(update: PresenceUpdate) -> Self {
        Record::PresenceUpdate(update)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    #[test]
    fn test_discriminant_conversion() {
        assert_eq!(Discriminant::try_from(1), Ok(Discriminant::Chat));
        assert_eq!(Discriminant::try_from(2), Ok(Discriminant::EntityUpdate));
        assert_eq!(Discriminant::try_from(3), Ok(Discriminant::PresenceUpdate));
        assert_eq!(Discriminant::try_from(999), Err(999));
        assert_eq!(i32::from(Discriminant::EntityUpdate), 2);
    }

    #[test]
    fn test_non_finite_location_not_serialized() {
        let record = Record::from(EntityUpdate {
            entity_id: 12,
            parent_entity_id: 0,
            entity_type: "ETribeEntityType::Ship".into(),
            ship_type: "EShipType::Sloop".into(),
            entity_name: "Drift".into(),
            server_id: 0,
            x: f32::NAN,
            y: f32::INFINITY,
            is_dead: false,
            is_new_entity: true,
            is_just_location_change: false,
        });
        assert!(record.to_json().is_err());

        let Record::EntityUpdate(mut update) = record else {
            unreachable!();
        };
        update.x = 0.5;
        update.y = 0.5;
        let json = Record::from(update).to_json().unwrap();
        assert!(json.contains(r#""X":0.5"#));
    }

    #[test]
    fn test_presence_json_shape() {
        let record = Record::from(PresenceUpdate {
            player_id: 42,
            last_online_at: 1_600_000_000,
        });
        let value: Value = serde_json::from_str(&record.to_json().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({"PlayerID": 42, "LastOnlineAt": 1_600_000_000})
        );
    }

    #[test]
    fn test_chat_json_field_names() {
        let record = Record::from(Chat {
            sender_name: "Bob".into(),
            sender_steam_name: "bob_steam".into(),
            sender_tribe_name: "Pirates".into(),
            sender_id: 9,
            message: "Hello".into(),
            sender_team_index: 3,
            send_mode: "EChatSendMode::LocalChat".into(),
            user_id: "7656".into(),
            use_admin_icon: false,
            is_tribe_owner: true,
            player_badge_group: 0,
        });
        let value: Value = serde_json::from_str(&record.to_json().unwrap()).unwrap();
        let object = value.as_object().unwrap();

        for key in [
            "SenderName",
            "SenderSteamName",
            "SenderTribeName",
            "SenderID",
            "Message",
            "SenderTeamIndex",
            "SendMode",
            "UserID",
            "UseAdminIcon",
            "IsTribeOwner",
            "PlayerBadgeGroup",
        ] {
            assert!(object.contains_key(key), "missing {key}");
        }
        assert_eq!(object.len(), 11);
        assert_eq!(value["IsTribeOwner"], json!(true));
    }

    #[test]
    fn test_entity_server_grid() {
        let update = EntityUpdate {
            entity_id: 1,
            parent_entity_id: 0,
            entity_type: "ETribeEntityType::Ship".into(),
            ship_type: String::new(),
            entity_name: "Black Pearl".into(),
            server_id: 0x0001_0002,
            x: 0.5,
            y: 0.25,
            is_dead: false,
            is_new_entity: true,
            is_just_location_change: false,
        };
        assert_eq!(update.server_grid(), [2, 1]);
        assert_eq!(Record::from(update).name(), "EntityUpdate");
    }
}
