#[cfg(test)]
use mockall::automock;

/// Role-based admission oracle, consulted on every local call and every
/// forward, plus once at login for initial group membership. Implementations
/// must be total and cheap. A router configured without a permit allows
/// everything and assigns no default groups.
#[cfg_attr(test, automock)]
pub trait Permit: Send + Sync + 'static {
    /// Groups a freshly logged-in user of this role joins.
    fn role_groups(&self, role: &str) -> Vec<String>;

    fn call_enable(&self, role: &str, msg_id: u32) -> bool;

    fn forward_enable(&self, source_role: &str, target_role: &str, msg_id: u32) -> bool;
}

/// Each role maps to its same-named group; all calls and forwards allowed.
pub struct LocalPermit;

impl Permit for LocalPermit {
    fn role_groups(&self, role: &str) -> Vec<String> {
        match role {
            "admin" => vec!["admin".to_string()],
            "user" => vec!["user".to_string()],
            _ => Vec::new(),
        }
    }

    fn call_enable(&self, _role: &str, _msg_id: u32) -> bool {
        true
    }

    fn forward_enable(&self, _source_role: &str, _target_role: &str, _msg_id: u32) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::admin("admin", vec!["admin".to_string()])]
    #[case::user("user", vec!["user".to_string()])]
    #[case::unknown("guest", Vec::new())]
    fn test_local_permit_groups(#[case] role: &str, #[case] expected: Vec<String>) {
        assert_eq!(LocalPermit.role_groups(role), expected);
    }

    #[test]
    fn test_local_permit_allows_everything() {
        assert!(LocalPermit.call_enable("user", 42));
        assert!(LocalPermit.forward_enable("user", "admin", 42));
    }
}
