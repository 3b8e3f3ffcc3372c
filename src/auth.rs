use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::PgWireResult;

/// Shared-password source for the cleartext startup handshake. Every tenant
/// accepts the same server password; the login user becomes the acting
/// principal for authorization.
#[derive(Debug)]
pub struct FleetlineAuthSource {
    password: String,
}

impl FleetlineAuthSource {
    pub fn new(password: String) -> Self {
        Self { password }
    }
}

#[async_trait]
impl AuthSource for FleetlineAuthSource {
    async fn get_password(&self, _login: &LoginInfo) -> PgWireResult<Password> {
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}
