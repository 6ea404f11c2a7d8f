//! Users, roles and grants created before auth is enabled

use kvprobe_client::KvClient;
use kvprobe_core::{Grant, Identity, KeyRange, ProbeError, ProbeResult, Role};

pub const ROOT_USER: &str = "root";
pub const ROOT_PASSWORD: &str = "rootPassword";
pub const TEST_USER: &str = "test";
pub const TEST_PASSWORD: &str = "testPassword";

/// Prefix the test role may read and write
pub const TEST_PREFIX: &str = "/test/";
/// Single key the test role may read and write
pub const TEST_SINGLE_KEY: &str = "/test0";

/// Administrator identity created by the fixture
pub fn root_identity() -> Identity {
    Identity::new(ROOT_USER, ROOT_PASSWORD).with_role(ROOT_USER)
}

/// Non-privileged identity created by the fixture
pub fn test_identity() -> Identity {
    Identity::new(TEST_USER, TEST_PASSWORD).with_role(TEST_USER)
}

/// One administrative call
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FixtureStep {
    UserAdd { name: String, password: String },
    RoleAdd { name: String },
    GrantPermission { role: String, grant: Grant },
    GrantRole { user: String, role: String },
}

impl FixtureStep {
    /// Operation name used in error reports
    pub fn operation(&self) -> String {
        match self {
            FixtureStep::UserAdd { name, .. } => format!("user_add({})", name),
            FixtureStep::RoleAdd { name } => format!("role_add({})", name),
            FixtureStep::GrantPermission { role, grant } => {
                format!("role_grant_permission({}, {}, {})", role, grant.range, grant.kind)
            }
            FixtureStep::GrantRole { user, role } => format!("user_grant_role({}, {})", user, role),
        }
    }

    async fn apply(&self, client: &dyn KvClient) -> Result<(), kvprobe_core::TransportError> {
        match self {
            FixtureStep::UserAdd { name, password } => client.user_add(name, password).await,
            FixtureStep::RoleAdd { name } => client.role_add(name).await,
            FixtureStep::GrantPermission { role, grant } => {
                client.role_grant_permission(role, grant).await
            }
            FixtureStep::GrantRole { user, role } => client.user_grant_role(user, role).await,
        }
    }
}

/// Identities and roles as data, plus the call order that creates them
#[derive(Clone, Debug)]
pub struct Fixture {
    identities: Vec<Identity>,
    roles: Vec<Role>,
    steps: Vec<FixtureStep>,
}

impl Fixture {
    /// "root" with the root role, "test" with read/write on `/test/` and `/test0`
    pub fn auth_cluster() -> Self {
        let root = root_identity();
        let test = test_identity();
        let root_role = Role::new(ROOT_USER);
        let test_role = Role::new(TEST_USER)
            .with_grant(Grant::read_write(KeyRange::prefix(TEST_PREFIX)))
            .with_grant(Grant::read_write(KeyRange::single(TEST_SINGLE_KEY)));

        let mut steps = vec![
            FixtureStep::UserAdd {
                name: root.username.clone(),
                password: root.password.clone(),
            },
            FixtureStep::RoleAdd {
                name: root_role.name.clone(),
            },
            FixtureStep::GrantRole {
                user: root.username.clone(),
                role: root_role.name.clone(),
            },
            FixtureStep::RoleAdd {
                name: test_role.name.clone(),
            },
        ];
        for grant in &test_role.grants {
            steps.push(FixtureStep::GrantPermission {
                role: test_role.name.clone(),
                grant: grant.clone(),
            });
        }
        steps.push(FixtureStep::UserAdd {
            name: test.username.clone(),
            password: test.password.clone(),
        });
        steps.push(FixtureStep::GrantRole {
            user: test.username.clone(),
            role: test_role.name.clone(),
        });

        Fixture {
            identities: vec![root, test],
            roles: vec![root_role, test_role],
            steps,
        }
    }

    pub fn identities(&self) -> &[Identity] {
        &self.identities
    }

    pub fn roles(&self) -> &[Role] {
        &self.roles
    }

    pub fn role(&self, name: &str) -> Option<&Role> {
        self.roles.iter().find(|r| r.name == name)
    }

    pub fn steps(&self) -> &[FixtureStep] {
        &self.steps
    }

    /// Issue every step in order; the first failure aborts with `Admin`
    pub async fn apply(&self, client: &dyn KvClient) -> ProbeResult<()> {
        for step in &self.steps {
            let operation = step.operation();
            tracing::debug!(%operation, "fixture step");
            step.apply(client)
                .await
                .map_err(|source| ProbeError::Admin { operation, source })?;
        }
        tracing::info!(
            users = self.identities.len(),
            roles = self.roles.len(),
            "fixture applied"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kvprobe_core::PermissionKind;

    #[test]
    fn test_step_order() {
        let fixture = Fixture::auth_cluster();
        let ops: Vec<String> = fixture.steps().iter().map(FixtureStep::operation).collect();
        assert_eq!(
            ops,
            vec![
                "user_add(root)",
                "role_add(root)",
                "user_grant_role(root, root)",
                "role_add(test)",
                "role_grant_permission(test, [/test/, /test0), readwrite)",
                "role_grant_permission(test, /test0, readwrite)",
                "user_add(test)",
                "user_grant_role(test, test)",
            ]
        );
    }

    #[test]
    fn test_role_grants_are_disjoint() {
        let fixture = Fixture::auth_cluster();
        let role = fixture.role(TEST_USER).unwrap();
        assert_eq!(role.grants.len(), 2);
        assert!(role.grants[0].range.is_disjoint(&role.grants[1].range));
        assert!(role.grants.iter().all(|g| g.kind == PermissionKind::ReadWrite));

        assert!(role.can_write(b"/test/7"));
        assert!(role.can_write(b"/test0"));
        assert!(!role.can_write(b"/test1"));
        assert!(!role.can_write(b"/other/key"));
    }

    #[test]
    fn test_identities() {
        let fixture = Fixture::auth_cluster();
        let names: Vec<&str> = fixture
            .identities()
            .iter()
            .map(|i| i.username.as_str())
            .collect();
        assert_eq!(names, vec!["root", "test"]);
        assert_eq!(root_identity().roles, vec!["root".to_string()]);
    }
}
