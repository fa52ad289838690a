use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::PgWireResult;

/// Login secrets. The admin user has its own password; everyone else shares `password`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub password: String,
    pub admin_user: String,
    pub admin_password: String,
}

/// Cleartext password source. The login name becomes the requester identity.
#[derive(Debug)]
pub struct ParkdAuthSource {
    credentials: Credentials,
}

impl ParkdAuthSource {
    pub fn new(credentials: Credentials) -> Self {
        Self { credentials }
    }

    fn password_for(&self, user: Option<&str>) -> &str {
        if user == Some(self.credentials.admin_user.as_str()) {
            &self.credentials.admin_password
        } else {
            &self.credentials.password
        }
    }
}

#[async_trait]
impl AuthSource for ParkdAuthSource {
    async fn get_password(&self, login: &LoginInfo) -> PgWireResult<Password> {
        tracing::debug!("password check for {:?}", login.user());
        let password = self.password_for(login.user());
        Ok(Password::new(None, password.as_bytes().to_vec()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source() -> ParkdAuthSource {
        ParkdAuthSource::new(Credentials {
            password: "shared".into(),
            admin_user: "admin".into(),
            admin_password: "root-only".into(),
        })
    }

    #[tokio::test]
    async fn admin_has_its_own_password() {
        let source = source();
        let login = LoginInfo::new(Some("admin"), Some("city"), "127.0.0.1".into());
        let password = source.get_password(&login).await.unwrap();
        assert_eq!(password.password(), b"root-only");
    }

    #[tokio::test]
    async fn other_users_share_the_password() {
        let source = source();
        for user in [Some("alice"), Some("administrator"), None] {
            let login = LoginInfo::new(user, Some("city"), "127.0.0.1".into());
            let password = source.get_password(&login).await.unwrap();
            assert_eq!(password.password(), b"shared");
        }
    }
}
