use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub name: String,
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
}

impl User {
    /// Role used for access checks when the server omits one.
    pub fn role_or_default(&self) -> &str {
        self.role.as_deref().unwrap_or("user")
    }

    pub fn has_role(&self, roles: &[&str]) -> bool {
        roles.contains(&self.role_or_default())
    }
}

/// Body for `PUT /user`. Unset fields are left untouched by the server.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ProfileUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_without_role_defaults_to_user() {
        let user: User =
            serde_json::from_str(r#"{"id": 7, "name": "Ada", "email": "ada@example.com"}"#)
                .unwrap();
        assert_eq!(user.role_or_default(), "user");
        assert!(user.has_role(&["user", "admin"]));
        assert!(!user.has_role(&["admin"]));

        // Missing role is not written back out
        let json = serde_json::to_string(&user).unwrap();
        assert!(!json.contains("role"));
    }

    #[test]
    fn test_profile_update_skips_unset_fields() {
        let update = ProfileUpdate {
            name: Some("Ada L.".to_string()),
            ..Default::default()
        };
        assert_eq!(
            serde_json::to_value(&update).unwrap(),
            serde_json::json!({"name": "Ada L."})
        );
    }
}
