use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ActorRole {
    Passenger,
    Driver,
    Admin,
    System,
}

impl std::str::FromStr for ActorRole {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "passenger" => Ok(ActorRole::Passenger),
            "driver" => Ok(ActorRole::Driver),
            "admin" => Ok(ActorRole::Admin),
            "system" => Ok(ActorRole::System),
            other => Err(format!(
                "unknown role: {other}, expected passenger/driver/admin/system"
            )),
        }
    }
}

/// An already authenticated caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub id: Uuid,
    pub role: ActorRole,
}

impl Actor {
    pub fn passenger(id: Uuid) -> Self {
        Self { id, role: ActorRole::Passenger }
    }

    pub fn driver(id: Uuid) -> Self {
        Self { id, role: ActorRole::Driver }
    }

    pub fn admin(id: Uuid) -> Self {
        Self { id, role: ActorRole::Admin }
    }

    pub fn system() -> Self {
        Self { id: Uuid::nil(), role: ActorRole::System }
    }

    pub fn is_staff(&self) -> bool {
        matches!(self.role, ActorRole::Admin | ActorRole::System)
    }
}
