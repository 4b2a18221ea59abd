use crate::schema::{acl_allows, Acl};

/// Effective permissions of a caller.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Auth {
    pub master: bool,
    pub user: Option<String>,
    pub roles: Vec<String>,
}

impl Auth {
    pub fn master() -> Self {
        Auth {
            master: true,
            ..Default::default()
        }
    }

    pub fn anonymous() -> Self {
        Auth::default()
    }

    pub fn user(id: impl Into<String>, roles: Vec<String>) -> Self {
        Auth {
            master: false,
            user: Some(id.into()),
            roles,
        }
    }

    /// ACL tokens: `*`, the user id, then `role:<name>` per role.
    pub fn tokens(&self) -> Vec<String> {
        let mut out = vec!["*".to_string()];
        out.extend(self.user.iter().cloned());
        out.extend(self.roles.iter().map(|r| format!("role:{r}")));
        out
    }

    pub fn allows(&self, acl: &Acl) -> bool {
        self.master || acl_allows(acl, &self.tokens())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_include_roles() {
        let auth = Auth::user("u1", vec!["admin".into()]);
        assert_eq!(auth.tokens(), vec!["*", "u1", "role:admin"]);
        assert!(auth.allows(&vec!["role:admin".to_string()]));
        assert!(!Auth::anonymous().allows(&vec!["u1".to_string()]));
        assert!(Auth::master().allows(&vec![]));
    }
}
