use serde::Serialize;

/// API credentials for the authenticated user channel.
///
/// `key` doubles as the user identity: the manager keeps at most one
/// user-channel connection per API key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Auth {
    pub key: String,
    pub secret: String,
    pub passphrase: String,
}

impl Auth {
    pub fn new(
        key: impl Into<String>,
        secret: impl Into<String>,
        passphrase: impl Into<String>,
    ) -> Self {
        Self {
            key: key.into(),
            secret: secret.into(),
            passphrase: passphrase.into(),
        }
    }
}

/// Wire form of [`Auth`] inside the user-channel subscription frame.
///
/// The upstream expects `apiKey` camel-cased while the other two fields
/// stay lowercase.
#[derive(Debug, Clone, Serialize)]
pub struct UserAuthentication {
    #[serde(rename = "apiKey")]
    pub api_key: String,
    pub secret: String,
    pub passphrase: String,
}

impl From<&Auth> for UserAuthentication {
    fn from(auth: &Auth) -> Self {
        Self {
            api_key: auth.key.clone(),
            secret: auth.secret.clone(),
            passphrase: auth.passphrase.clone(),
        }
    }
}
