use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::PgWireResult;

/// Shared-password auth. The login user names the connecting subject; it is
/// only checked when a statement acts on the caller's behalf.
#[derive(Debug)]
pub struct SharedPasswordAuth {
    password: String,
}

impl SharedPasswordAuth {
    pub fn new(password: String) -> Self {
        Self { password }
    }
}

#[async_trait]
impl AuthSource for SharedPasswordAuth {
    async fn get_password(&self, login: &LoginInfo) -> PgWireResult<Password> {
        tracing::debug!("password login for {:?}", login.user());
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}
