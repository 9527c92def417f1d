//! Authentication policies and the join decision.
//!
//! An [`Authenticator`] runs the challenge/response sub-protocol for one
//! enrollment session. Factories are registered by policy name in the
//! [`SecurityManager`], which also holds per-supporting-DIF profiles and the
//! access-control decision consulted once authentication succeeds.

use crate::directory::Neighbor;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

pub const AUTH_NONE: &str = "PSOC_authentication-none";
pub const AUTH_PASSWORD: &str = "PSOC_authentication-password";

const CHALLENGE_LENGTH: usize = 32;

/// Result of an authentication step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AuthStatus {
    Failed,
    InProgress,
    Successful,
}

/// Policy descriptor carried on open-connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthPolicy {
    pub name: String,
    #[serde(default)]
    pub versions: Vec<String>,
}

impl AuthPolicy {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            versions: vec!["1".to_string()],
        }
    }
}

/// One round of an authentication sub-protocol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthMessage {
    pub policy: String,
    pub payload: Vec<u8>,
}

/// Status plus an optional message to send to the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthStep {
    pub status: AuthStatus,
    pub reply: Option<AuthMessage>,
}

impl AuthStep {
    pub fn done(status: AuthStatus) -> Self {
        Self {
            status,
            reply: None,
        }
    }

    pub fn reply(status: AuthStatus, message: AuthMessage) -> Self {
        Self {
            status,
            reply: Some(message),
        }
    }
}

/// Per-session authentication state.
pub trait Authenticator: Send {
    /// Descriptor offered to the peer on open-connection.
    fn descriptor(&self) -> AuthPolicy;

    /// Start authenticating a peer that offered `offered` (accepting side).
    fn initiate_authentication(&mut self, offered: &AuthPolicy) -> AuthStep;

    /// Feed a sub-protocol message from the peer.
    fn process_incoming_message(&mut self, message: &AuthMessage) -> AuthStep;
}

/// Security settings for enrollments over one supporting DIF.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthProfile {
    pub policy: String,
    #[serde(default)]
    pub password: Option<String>,
}

impl Default for AuthProfile {
    fn default() -> Self {
        Self {
            policy: AUTH_NONE.to_string(),
            password: None,
        }
    }
}

/// Creates authenticators for one policy.
pub trait AuthPolicyFactory: Send + Sync {
    fn name(&self) -> &str;
    fn instantiate(&self, profile: &AuthProfile) -> Box<dyn Authenticator>;
}

/// Decides whether an authenticated peer may join.
pub trait AccessControl: Send + Sync {
    fn is_allowed_to_join(&self, peer: &Neighbor) -> bool;
}

/// Accepts every authenticated peer.
#[derive(Debug, Default)]
pub struct AllowAll;

impl AccessControl for AllowAll {
    fn is_allowed_to_join(&self, _peer: &Neighbor) -> bool {
        true
    }
}

/// Accepts only listed process names.
#[derive(Debug, Default)]
pub struct AllowList {
    names: Vec<String>,
}

impl AllowList {
    pub fn new(names: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            names: names.into_iter().map(Into::into).collect(),
        }
    }
}

impl AccessControl for AllowList {
    fn is_allowed_to_join(&self, peer: &Neighbor) -> bool {
        self.names.iter().any(|n| n == &peer.name)
    }
}

// ============================================================================
// Built-in policies
// ============================================================================

/// No authentication.
#[derive(Debug, Default)]
pub struct NoneAuth;

impl Authenticator for NoneAuth {
    fn descriptor(&self) -> AuthPolicy {
        AuthPolicy::new(AUTH_NONE)
    }

    fn initiate_authentication(&mut self, _offered: &AuthPolicy) -> AuthStep {
        AuthStep::done(AuthStatus::Successful)
    }

    fn process_incoming_message(&mut self, _message: &AuthMessage) -> AuthStep {
        AuthStep::done(AuthStatus::Successful)
    }
}

#[derive(Debug, Default)]
pub struct NoneAuthFactory;

impl AuthPolicyFactory for NoneAuthFactory {
    fn name(&self) -> &str {
        AUTH_NONE
    }

    fn instantiate(&self, _profile: &AuthProfile) -> Box<dyn Authenticator> {
        Box::new(NoneAuth)
    }
}

/// Shared-password challenge/response.
///
/// The accepting side sends a random challenge. The joining side answers with
/// the challenge XOR-ed with the password; the accepting side checks it.
pub struct PasswordAuth {
    password: Vec<u8>,
    challenge: Option<Vec<u8>>,
}

impl PasswordAuth {
    pub fn new(password: impl Into<String>) -> Self {
        Self {
            password: password.into().into_bytes(),
            challenge: None,
        }
    }

    fn cipher(&self, data: &[u8]) -> Vec<u8> {
        if self.password.is_empty() {
            return data.to_vec();
        }
        data.iter()
            .zip(self.password.iter().cycle())
            .map(|(d, p)| d ^ p)
            .collect()
    }

    fn message(&self, payload: Vec<u8>) -> AuthMessage {
        AuthMessage {
            policy: AUTH_PASSWORD.to_string(),
            payload,
        }
    }
}

impl Authenticator for PasswordAuth {
    fn descriptor(&self) -> AuthPolicy {
        AuthPolicy::new(AUTH_PASSWORD)
    }

    fn initiate_authentication(&mut self, offered: &AuthPolicy) -> AuthStep {
        if offered.name != AUTH_PASSWORD {
            return AuthStep::done(AuthStatus::Failed);
        }

        let mut challenge = vec![0u8; CHALLENGE_LENGTH];
        rand::rng().fill(&mut challenge[..]);
        self.challenge = Some(challenge.clone());

        AuthStep::reply(AuthStatus::InProgress, self.message(challenge))
    }

    fn process_incoming_message(&mut self, message: &AuthMessage) -> AuthStep {
        if message.policy != AUTH_PASSWORD {
            return AuthStep::done(AuthStatus::Failed);
        }

        match self.challenge.take() {
            // Accepting side: verify the answer to our challenge
            Some(challenge) => {
                if self.cipher(&message.payload) == challenge {
                    AuthStep::done(AuthStatus::Successful)
                } else {
                    AuthStep::done(AuthStatus::Failed)
                }
            }
            // Joining side: answer the challenge
            None => {
                let answer = self.cipher(&message.payload);
                AuthStep::reply(AuthStatus::InProgress, self.message(answer))
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct PasswordAuthFactory;

impl AuthPolicyFactory for PasswordAuthFactory {
    fn name(&self) -> &str {
        AUTH_PASSWORD
    }

    fn instantiate(&self, profile: &AuthProfile) -> Box<dyn Authenticator> {
        Box::new(PasswordAuth::new(profile.password.clone().unwrap_or_default()))
    }
}

// ============================================================================
// Security manager
// ============================================================================

/// Registry of authentication policies, profiles and access control.
pub struct SecurityManager {
    factories: HashMap<String, Arc<dyn AuthPolicyFactory>>,
    profiles: HashMap<String, AuthProfile>,
    default_profile: AuthProfile,
    access_control: Arc<dyn AccessControl>,
}

impl Default for SecurityManager {
    fn default() -> Self {
        let mut manager = Self {
            factories: HashMap::new(),
            profiles: HashMap::new(),
            default_profile: AuthProfile::default(),
            access_control: Arc::new(AllowAll),
        };
        manager.register(Arc::new(NoneAuthFactory));
        manager.register(Arc::new(PasswordAuthFactory));
        manager
    }
}

impl SecurityManager {
    /// Manager with the built-in policies and an allow-all join decision.
    pub fn new() -> Self {
        Self::default()
    }

    /// Manager with no registered policies.
    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
            profiles: HashMap::new(),
            default_profile: AuthProfile::default(),
            access_control: Arc::new(AllowAll),
        }
    }

    pub fn register(&mut self, factory: Arc<dyn AuthPolicyFactory>) {
        self.factories.insert(factory.name().to_string(), factory);
    }

    pub fn with_profile(mut self, dif: impl Into<String>, profile: AuthProfile) -> Self {
        self.profiles.insert(dif.into(), profile);
        self
    }

    pub fn with_default_profile(mut self, profile: AuthProfile) -> Self {
        self.default_profile = profile;
        self
    }

    pub fn with_access_control(mut self, access_control: Arc<dyn AccessControl>) -> Self {
        self.access_control = access_control;
        self
    }

    /// Profile for enrollments over `dif`, falling back to the default.
    pub fn profile_for(&self, dif: Option<&str>) -> &AuthProfile {
        dif.and_then(|d| self.profiles.get(d))
            .unwrap_or(&self.default_profile)
    }

    pub fn policy_set(&self, name: &str) -> Option<Arc<dyn AuthPolicyFactory>> {
        self.factories.get(name).cloned()
    }

    /// Authenticator for a joining session over `dif`.
    pub fn authenticator_for(&self, dif: Option<&str>) -> Option<Box<dyn Authenticator>> {
        let profile = self.profile_for(dif);
        self.policy_set(&profile.policy)
            .map(|factory| factory.instantiate(profile))
    }

    /// Authenticator for an accepting session that was offered `policy`.
    ///
    /// The offer must name the policy configured for `dif`; anything else,
    /// including a weaker policy, gets no authenticator.
    pub fn authenticator_for_offer(
        &self,
        policy: &AuthPolicy,
        dif: Option<&str>,
    ) -> Option<Box<dyn Authenticator>> {
        let profile = self.profile_for(dif);
        if profile.policy != policy.name {
            return None;
        }
        self.policy_set(&policy.name)
            .map(|factory| factory.instantiate(profile))
    }

    pub fn is_allowed_to_join(&self, peer: &Neighbor) -> bool {
        self.access_control.is_allowed_to_join(peer)
    }
}
