use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};

use crate::limits::MAX_USER_ID_LEN;

/// Shared-password auth. The login user name becomes the caller identity
/// (item owner / renter), so it has to be present and bounded.
#[derive(Debug)]
pub struct RentdAuthSource {
    password: String,
}

impl RentdAuthSource {
    pub fn new(password: String) -> Self {
        Self { password }
    }
}

#[async_trait]
impl AuthSource for RentdAuthSource {
    async fn get_password(&self, login: &LoginInfo) -> PgWireResult<Password> {
        if let Err(reason) = check_login_user(login.user()) {
            metrics::counter!(crate::observability::AUTH_FAILURES_TOTAL).increment(1);
            return Err(PgWireError::UserError(Box::new(ErrorInfo::new(
                "FATAL".into(),
                "28000".into(),
                reason.into(),
            ))));
        }
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}

fn check_login_user(user: Option<&str>) -> Result<(), &'static str> {
    match user {
        None | Some("") => Err("a user name is required"),
        Some(u) if u.len() > MAX_USER_ID_LEN => Err("user name too long"),
        Some(_) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn login_user_required() {
        assert!(check_login_user(None).is_err());
        assert!(check_login_user(Some("")).is_err());
        assert!(check_login_user(Some("alice")).is_ok());
    }

    #[test]
    fn login_user_bounded() {
        let long = "u".repeat(MAX_USER_ID_LEN + 1);
        assert_eq!(check_login_user(Some(&long)), Err("user name too long"));
        let max = "u".repeat(MAX_USER_ID_LEN);
        assert!(check_login_user(Some(&max)).is_ok());
    }
}
