//! Request authorization
//!
//! Every protocol operation asks an [`AuthGate`] before touching any state.
//! Two gates are provided:
//! - [`AllowAll`] for open registries and tests
//! - [`StaticTokens`] for a fixed table of access tokens

use std::fmt;

use async_trait::async_trait;
use secret::Secret;
use serde::{Deserialize, Serialize};

/// What a request wants to do with a repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    /// Check for or download blobs.
    Pull,
    /// Upload blobs.
    Push,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Pull => f.write_str("pull"),
            Action::Push => f.write_str("push"),
        }
    }
}

/// The question put to an [`AuthGate`].
#[derive(Debug, Clone, Copy)]
pub struct AuthRequest<'a> {
    /// Requested action
    pub action: Action,
    /// Repository as `namespace/name`, exactly as the client sent it
    pub repository: &'a str,
    /// Raw `Authorization` header, if any
    pub credentials: Option<&'a str>,
}

/// What an allowed request may access.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scope {
    /// Repository the grant applies to
    pub repository: String,
    /// Actions granted on it
    pub actions: Vec<Action>,
}

/// The answer from an [`AuthGate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Authorization {
    /// Whether the request may proceed. `false` is final.
    pub allowed: bool,
    /// The access that was granted, when known
    pub scope: Option<Scope>,
}

impl Authorization {
    /// Allow the request.
    pub fn allow(scope: Option<Scope>) -> Self {
        Self {
            allowed: true,
            scope,
        }
    }

    /// Refuse the request.
    pub fn deny() -> Self {
        Self {
            allowed: false,
            scope: None,
        }
    }
}

/// Decides whether a request may proceed.
#[async_trait]
pub trait AuthGate: fmt::Debug + Send + Sync {
    /// Authorize `request`.
    async fn authorize(&self, request: &AuthRequest<'_>) -> Authorization;
}

static_assertions::assert_obj_safe!(AuthGate);

/// Allows every request.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

#[async_trait]
impl AuthGate for AllowAll {
    async fn authorize(&self, request: &AuthRequest<'_>) -> Authorization {
        Authorization::allow(Some(Scope {
            repository: request.repository.to_owned(),
            actions: vec![Action::Pull, Action::Push],
        }))
    }
}

/// One access token and what it may do.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenGrant {
    /// The token clients present
    pub token: Secret,

    /// Repository patterns: `*`, `namespace/*` or an exact `namespace/name`
    #[serde(default = "TokenGrant::any_repository")]
    pub repositories: Vec<String>,

    /// Actions granted on matching repositories
    #[serde(default = "TokenGrant::all_actions")]
    pub actions: Vec<Action>,
}

impl TokenGrant {
    /// A token with full access to every repository.
    pub fn new(token: impl Into<Secret>) -> Self {
        Self {
            token: token.into(),
            repositories: Self::any_repository(),
            actions: Self::all_actions(),
        }
    }

    /// Limit the grant to repositories matching `patterns`.
    pub fn repositories<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.repositories = patterns.into_iter().map(Into::into).collect();
        self
    }

    /// Limit the grant to `actions`.
    pub fn actions(mut self, actions: impl IntoIterator<Item = Action>) -> Self {
        self.actions = actions.into_iter().collect();
        self
    }

    fn any_repository() -> Vec<String> {
        vec!["*".to_owned()]
    }

    fn all_actions() -> Vec<Action> {
        vec![Action::Pull, Action::Push]
    }

    fn covers(&self, repository: &str) -> bool {
        self.repositories
            .iter()
            .any(|pattern| pattern_matches(pattern, repository))
    }
}

fn pattern_matches(pattern: &str, repository: &str) -> bool {
    if pattern == "*" {
        return true;
    }

    match pattern.strip_suffix("/*") {
        Some(namespace) => repository
            .split_once('/')
            .is_some_and(|(ns, _)| ns == namespace),
        None => pattern == repository,
    }
}

/// Authorizes requests against a fixed table of tokens.
///
/// Tokens are accepted as `Bearer <token>`, or as the password of `Basic`
/// credentials, since that is what `docker login` sends.
#[derive(Debug, Clone, Default)]
pub struct StaticTokens {
    grants: Vec<TokenGrant>,
}

impl StaticTokens {
    /// Create a gate from a list of grants.
    pub fn new(grants: impl IntoIterator<Item = TokenGrant>) -> Self {
        Self {
            grants: grants.into_iter().collect(),
        }
    }

    /// Add a grant.
    pub fn grant(mut self, grant: TokenGrant) -> Self {
        self.grants.push(grant);
        self
    }
}

/// Pull the token out of an `Authorization` header value.
fn presented_token(header: &str) -> Option<String> {
    use base64::Engine as _;
    use base64::prelude::BASE64_STANDARD;

    let (scheme, value) = header.trim().split_once(' ')?;
    let value = value.trim();

    if scheme.eq_ignore_ascii_case("bearer") {
        return Some(value.to_owned());
    }

    if scheme.eq_ignore_ascii_case("basic") {
        let decoded = BASE64_STANDARD.decode(value).ok()?;
        let decoded = String::from_utf8(decoded).ok()?;
        let (_, password) = decoded.split_once(':')?;
        return Some(password.to_owned());
    }

    None
}

#[async_trait]
impl AuthGate for StaticTokens {
    async fn authorize(&self, request: &AuthRequest<'_>) -> Authorization {
        let Some(token) = request.credentials.and_then(presented_token) else {
            tracing::debug!(repository = request.repository, "no usable credentials");
            return Authorization::deny();
        };

        let granted = self.grants.iter().find(|grant| {
            grant.token.matches(&token)
                && grant.actions.contains(&request.action)
                && grant.covers(request.repository)
        });

        match granted {
            Some(grant) => Authorization::allow(Some(Scope {
                repository: request.repository.to_owned(),
                actions: grant.actions.clone(),
            })),
            None => {
                tracing::debug!(
                    repository = request.repository,
                    action = %request.action,
                    "token does not grant access"
                );
                Authorization::deny()
            }
        }
    }
}
