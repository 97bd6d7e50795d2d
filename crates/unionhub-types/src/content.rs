use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Closed set of content kinds the store accepts. Every kind shares the same
/// envelope at the storage layer; only the read side interprets the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    Meetings,
    Votes,
    News,
    Employees,
    Officials,
    Contracts,
    Benefits,
    Faqs,
    Notifications,
}

impl ContentType {
    pub const ALL: [ContentType; 9] = [
        ContentType::Meetings,
        ContentType::Votes,
        ContentType::News,
        ContentType::Employees,
        ContentType::Officials,
        ContentType::Contracts,
        ContentType::Benefits,
        ContentType::Faqs,
        ContentType::Notifications,
    ];

    pub fn parse(value: &str) -> Option<Self> {
        match value.to_lowercase().as_str() {
            "meetings" => Some(Self::Meetings),
            "votes" => Some(Self::Votes),
            "news" => Some(Self::News),
            "employees" => Some(Self::Employees),
            "officials" => Some(Self::Officials),
            "contracts" => Some(Self::Contracts),
            "benefits" => Some(Self::Benefits),
            "faqs" => Some(Self::Faqs),
            "notifications" => Some(Self::Notifications),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Meetings => "meetings",
            Self::Votes => "votes",
            Self::News => "news",
            Self::Employees => "employees",
            Self::Officials => "officials",
            Self::Contracts => "contracts",
            Self::Benefits => "benefits",
            Self::Faqs => "faqs",
            Self::Notifications => "notifications",
        }
    }

    /// Human-readable singular label used in email subjects.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Meetings => "Meeting",
            Self::Votes => "Vote",
            Self::News => "News",
            Self::Employees => "Employee",
            Self::Officials => "Official",
            Self::Contracts => "Contract",
            Self::Benefits => "Benefit",
            Self::Faqs => "FAQ",
            Self::Notifications => "Notification Settings",
        }
    }
}

/// User roles. Stored as snake_case strings in the database and in JWT claims.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Director,
    Principal,
    VicePrincipal,
    Teacher,
    Employee,
    TechStaff,
}

impl Role {
    /// Roles a director or principal can assign to other users.
    pub const ASSIGNABLE: [Role; 5] = [
        Role::Principal,
        Role::Teacher,
        Role::Employee,
        Role::VicePrincipal,
        Role::TechStaff,
    ];

    pub fn parse(value: &str) -> Option<Self> {
        match value.to_lowercase().as_str() {
            "director" => Some(Self::Director),
            "principal" => Some(Self::Principal),
            "vice_principal" => Some(Self::VicePrincipal),
            "teacher" => Some(Self::Teacher),
            "employee" => Some(Self::Employee),
            "tech_staff" => Some(Self::TechStaff),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Director => "director",
            Self::Principal => "principal",
            Self::VicePrincipal => "vice_principal",
            Self::Teacher => "teacher",
            Self::Employee => "employee",
            Self::TechStaff => "tech_staff",
        }
    }
}

/// A stored content item: envelope fields plus the freeform payload.
///
/// The payload is intentionally unvalidated here; each kind carries its own
/// evolving shape and the route layer owns interpretation.
#[derive(Debug, Clone, Serialize)]
pub struct ContentItem {
    pub id: i64,
    #[serde(rename = "type")]
    pub kind: ContentType,
    pub data: Map<String, Value>,
    pub created_by: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub creator_email: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// Reminder configuration, kept in its own single-row table so the scheduler
/// reads it O(1) instead of scanning notifications for the highest id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReminderSettings {
    pub enabled: bool,
    pub selected_time: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_type_round_trips() {
        for kind in ContentType::ALL {
            assert_eq!(ContentType::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(ContentType::parse("MEETINGS"), Some(ContentType::Meetings));
        assert_eq!(ContentType::parse("articles"), None);
    }

    #[test]
    fn role_round_trips() {
        assert_eq!(Role::parse("vice_principal"), Some(Role::VicePrincipal));
        assert_eq!(Role::parse("Director"), Some(Role::Director));
        assert_eq!(Role::parse("admin"), None);
    }
}
