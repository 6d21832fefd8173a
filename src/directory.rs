use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Caller role, carried as its numeric code on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "i32", into = "i32")]
pub enum Role {
    Admin,
    Owner,
    Bookkeeper,
    Reservationist,
    Other(i32),
}

impl From<i32> for Role {
    fn from(code: i32) -> Self {
        match code {
            50 => Role::Admin,
            40 => Role::Owner,
            30 => Role::Bookkeeper,
            29 => Role::Reservationist,
            other => Role::Other(other),
        }
    }
}

impl From<Role> for i32 {
    fn from(role: Role) -> Self {
        match role {
            Role::Admin => 50,
            Role::Owner => 40,
            Role::Bookkeeper => 30,
            Role::Reservationist => 29,
            Role::Other(code) => code,
        }
    }
}

/// The acting user, resolved once per request by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthContext {
    pub user_id: Ulid,
    pub role: Role,
}

/// Resolves which account a saved booking is stamped with.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn property_user(&self, actor: &AuthContext) -> Option<Ulid>;
    async fn bookkeeper_user(&self, actor: &AuthContext) -> Option<Ulid>;
    async fn reservationist_user(&self, actor: &AuthContext) -> Option<Ulid>;

    /// Role-based assignment. Roles without a rule keep `current`.
    async fn assign(&self, actor: &AuthContext, current: Option<Ulid>) -> Option<Ulid> {
        match actor.role {
            Role::Admin | Role::Owner => self.property_user(actor).await,
            Role::Bookkeeper => self.bookkeeper_user(actor).await,
            Role::Reservationist => self.reservationist_user(actor).await,
            Role::Other(_) => current,
        }
    }
}

/// Directory with one fixed account per role group.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoleDirectory {
    pub property: Option<Ulid>,
    pub bookkeeper: Option<Ulid>,
    pub reservationist: Option<Ulid>,
}

#[async_trait]
impl UserDirectory for RoleDirectory {
    async fn property_user(&self, _actor: &AuthContext) -> Option<Ulid> {
        self.property
    }

    async fn bookkeeper_user(&self, _actor: &AuthContext) -> Option<Ulid> {
        self.bookkeeper
    }

    async fn reservationist_user(&self, _actor: &AuthContext) -> Option<Ulid> {
        self.reservationist
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn directory() -> RoleDirectory {
        RoleDirectory {
            property: Some(Ulid::new()),
            bookkeeper: Some(Ulid::new()),
            reservationist: Some(Ulid::new()),
        }
    }

    fn actor(code: i32) -> AuthContext {
        AuthContext {
            user_id: Ulid::new(),
            role: Role::from(code),
        }
    }

    #[tokio::test]
    async fn admin_and_owner_map_to_property_user() {
        let dir = directory();
        assert_eq!(dir.assign(&actor(50), None).await, dir.property);
        assert_eq!(dir.assign(&actor(40), None).await, dir.property);
    }

    #[tokio::test]
    async fn staff_roles_map_to_their_accounts() {
        let dir = directory();
        assert_eq!(dir.assign(&actor(30), None).await, dir.bookkeeper);
        assert_eq!(dir.assign(&actor(29), None).await, dir.reservationist);
    }

    #[tokio::test]
    async fn other_roles_keep_current_user() {
        let dir = directory();
        let current = Some(Ulid::new());
        assert_eq!(dir.assign(&actor(10), current).await, current);
        assert_eq!(dir.assign(&actor(10), None).await, None);
    }

    #[test]
    fn role_codes_roundtrip_through_json() {
        let auth: AuthContext =
            serde_json::from_str(r#"{"user_id":"01ARZ3NDEKTSV4RRFFQ69G5FAV","role":30}"#).unwrap();
        assert_eq!(auth.role, Role::Bookkeeper);
        assert_eq!(i32::from(Role::Other(7)), 7);
    }
}
