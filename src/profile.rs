use std::{future::Future, sync::Arc};

use tokio::{sync::watch, task::JoinSet};

use crate::{
    auth::AuthProvider,
    error::PortalError,
    models::{Identity, Role, UserProfile},
};

pub const DEFAULT_PRIVILEGED_EMAIL: &str = "admin@groupscholar.com";
pub const MASTER_ADMIN_NAME: &str = "Master Admin";

/// Whether `email` is the built-in privileged address.
pub fn is_privileged_email(email: &str) -> bool {
    AdminOverride::default().is_privileged(Some(email))
}

/// Single-address rule that forces the admin role.
#[derive(Debug, Clone)]
pub struct AdminOverride {
    privileged_email: String,
}

impl Default for AdminOverride {
    fn default() -> Self {
        Self::new(DEFAULT_PRIVILEGED_EMAIL)
    }
}

impl AdminOverride {
    pub fn new(privileged_email: impl Into<String>) -> Self {
        Self {
            privileged_email: privileged_email.into(),
        }
    }

    pub fn is_privileged(&self, email: Option<&str>) -> bool {
        email == Some(self.privileged_email.as_str())
    }
}

/// Stored profile records, keyed by identity uid (collection `users`).
pub trait ProfileStore: Send + Sync {
    fn fetch_profile(
        &self,
        uid: &str,
    ) -> impl Future<Output = Result<Option<UserProfile>, PortalError>> + Send;
}

pub struct ProfileResolver<S> {
    store: S,
    policy: AdminOverride,
}

impl<S: ProfileStore> ProfileResolver<S> {
    pub fn new(store: S, policy: AdminOverride) -> Self {
        Self { store, policy }
    }

    pub async fn resolve(
        &self,
        identity: Option<&Identity>,
    ) -> Result<Option<UserProfile>, PortalError> {
        let identity = match identity {
            Some(identity) => identity,
            None => return Ok(None),
        };
        let privileged = self.policy.is_privileged(identity.email.as_deref());

        match self.store.fetch_profile(&identity.uid).await? {
            Some(mut profile) => {
                if privileged {
                    profile.role = Role::Admin;
                }
                Ok(Some(profile))
            }
            None if privileged => {
                tracing::info!(uid = %identity.uid, "No stored profile for privileged identity; using default admin");
                Ok(Some(UserProfile {
                    uid: identity.uid.clone(),
                    email: identity.email.clone().unwrap_or_default(),
                    role: Role::Admin,
                    name: MASTER_ADMIN_NAME.to_string(),
                    subjects: None,
                    classes: None,
                    school_class: None,
                    is_locked: None,
                }))
            }
            None => Ok(None),
        }
    }
}

/// Tag carried by each in-flight resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ticket {
    generation: u64,
    uid: Option<String>,
}

/// Hands out tickets; only the most recent one may publish.
#[derive(Debug, Default)]
pub struct ResolutionTracker {
    latest: u64,
}

impl ResolutionTracker {
    pub fn begin(&mut self, identity: Option<&Identity>) -> Ticket {
        self.latest += 1;
        Ticket {
            generation: self.latest,
            uid: identity.map(|i| i.uid.clone()),
        }
    }

    pub fn is_current(&self, ticket: &Ticket) -> bool {
        ticket.generation == self.latest
    }
}

type Resolution = (Ticket, Result<Option<UserProfile>, PortalError>);

/// Keeps the signed-in user's profile in step with the auth provider.
pub struct ProfileSession<A, S> {
    auth: Arc<A>,
    resolver: Arc<ProfileResolver<S>>,
    profile: watch::Sender<Option<UserProfile>>,
}

impl<A, S> ProfileSession<A, S>
where
    A: AuthProvider + 'static,
    S: ProfileStore + 'static,
{
    pub fn new(auth: Arc<A>, resolver: ProfileResolver<S>) -> Self {
        let (profile, _) = watch::channel(None);
        Self {
            auth,
            resolver: Arc::new(resolver),
            profile,
        }
    }

    pub fn profile(&self) -> watch::Receiver<Option<UserProfile>> {
        self.profile.subscribe()
    }

    pub fn current(&self) -> Option<UserProfile> {
        self.profile.borrow().clone()
    }

    pub async fn sign_out(&self) -> Result<(), PortalError> {
        self.auth.sign_out().await
    }

    /// Follows auth-state changes until the feed ends or `shutdown`
    /// completes, then drops the auth subscription.
    pub async fn run<F>(&self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        let mut auth_states = self.auth.on_auth_state_changed();
        let mut tracker = ResolutionTracker::default();
        let mut in_flight: JoinSet<Resolution> = JoinSet::new();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                state = auth_states.next() => {
                    let identity = match state {
                        Some(identity) => identity,
                        None => break,
                    };
                    let ticket = tracker.begin(identity.as_ref());
                    tracing::debug!(uid = ?ticket.uid, generation = ticket.generation, "Auth state changed");

                    let held_uid = self.profile.borrow().as_ref().map(|p| p.uid.clone());
                    if held_uid != ticket.uid {
                        self.publish(None);
                    }

                    let resolver = Arc::clone(&self.resolver);
                    in_flight.spawn(async move {
                        let result = resolver.resolve(identity.as_ref()).await;
                        (ticket, result)
                    });
                },
                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    match joined {
                        Ok((ticket, result)) => self.apply(&tracker, ticket, result),
                        Err(e) => tracing::error!(error = %e, "Profile resolution task failed"),
                    }
                },
            }
        }

        auth_states.unsubscribe();
    }

    fn apply(
        &self,
        tracker: &ResolutionTracker,
        ticket: Ticket,
        result: Result<Option<UserProfile>, PortalError>,
    ) {
        if !tracker.is_current(&ticket) {
            tracing::debug!(uid = ?ticket.uid, generation = ticket.generation, "Discarding stale profile resolution");
            return;
        }

        match result {
            Ok(profile) => self.publish(profile),
            Err(e) => {
                tracing::error!(uid = ?ticket.uid, error = %e, "Profile resolution failed");
                self.publish(None);
            }
        }
    }

    fn publish(&self, profile: Option<UserProfile>) {
        self.profile.send_if_modified(|held| {
            if *held == profile {
                false
            } else {
                *held = profile;
                true
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::LocalAuth;
    use std::{collections::HashMap, time::Duration};

    #[derive(Default)]
    struct FakeStore {
        records: HashMap<String, (UserProfile, Duration)>,
        unreachable: bool,
    }

    impl FakeStore {
        fn with(mut self, uid: &str, email: &str, role: Role, delay_secs: u64) -> Self {
            let profile = UserProfile {
                uid: uid.to_string(),
                email: email.to_string(),
                role,
                name: format!("User {uid}"),
                subjects: Some(vec!["math".to_string()]),
                classes: None,
                school_class: Some("7B".to_string()),
                is_locked: None,
            };
            self.records
                .insert(uid.to_string(), (profile, Duration::from_secs(delay_secs)));
            self
        }
    }

    impl ProfileStore for FakeStore {
        async fn fetch_profile(&self, uid: &str) -> Result<Option<UserProfile>, PortalError> {
            if self.unreachable {
                return Err(PortalError::Transport("profile store offline".to_string()));
            }
            match self.records.get(uid) {
                Some((profile, delay)) => {
                    tokio::time::sleep(*delay).await;
                    Ok(Some(profile.clone()))
                }
                None => Ok(None),
            }
        }
    }

    fn resolver(store: FakeStore) -> ProfileResolver<FakeStore> {
        ProfileResolver::new(store, AdminOverride::default())
    }

    #[test]
    fn privileged_email_matches_exactly() {
        assert!(is_privileged_email(DEFAULT_PRIVILEGED_EMAIL));
        assert!(!is_privileged_email("someone@groupscholar.com"));
        assert!(!AdminOverride::default().is_privileged(None));
        assert!(AdminOverride::new("root@school.test").is_privileged(Some("root@school.test")));
    }

    #[tokio::test]
    async fn privileged_email_forces_admin_over_stored_role() {
        for stored in [Role::Student, Role::Teacher, Role::Moderator, Role::Viewer] {
            let r = resolver(FakeStore::default().with("u1", DEFAULT_PRIVILEGED_EMAIL, stored, 0));
            let identity = Identity::new("u1", Some(DEFAULT_PRIVILEGED_EMAIL));
            let profile = r.resolve(Some(&identity)).await.unwrap().unwrap();
            assert_eq!(profile.role, Role::Admin);
            assert_eq!(profile.name, "User u1");
        }
    }

    #[tokio::test]
    async fn stored_role_kept_for_ordinary_users() {
        let r = resolver(FakeStore::default().with("u2", "kiara@example.com", Role::Teacher, 0));
        let identity = Identity::new("u2", Some("kiara@example.com"));
        let profile = r.resolve(Some(&identity)).await.unwrap().unwrap();
        assert_eq!(profile.role, Role::Teacher);
    }

    #[tokio::test]
    async fn privileged_identity_without_record_gets_default_admin() {
        let r = resolver(FakeStore::default());
        let identity = Identity::new("root", Some(DEFAULT_PRIVILEGED_EMAIL));
        let profile = r.resolve(Some(&identity)).await.unwrap().unwrap();
        assert_eq!(profile.uid, "root");
        assert_eq!(profile.email, DEFAULT_PRIVILEGED_EMAIL);
        assert_eq!(profile.role, Role::Admin);
        assert_eq!(profile.name, MASTER_ADMIN_NAME);
    }

    #[tokio::test]
    async fn unknown_ordinary_identity_resolves_absent() {
        let r = resolver(FakeStore::default().with("u1", "a@example.com", Role::Student, 0));
        assert_eq!(r.resolve(None).await.unwrap(), None);
        let stranger = Identity::new("ghost", Some("ghost@example.com"));
        assert_eq!(r.resolve(Some(&stranger)).await.unwrap(), None);
        let no_email = Identity::new("ghost", None);
        assert_eq!(r.resolve(Some(&no_email)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn unreachable_store_is_a_resolution_failure() {
        let store = FakeStore {
            unreachable: true,
            ..FakeStore::default()
        };
        let identity = Identity::new("u1", Some(DEFAULT_PRIVILEGED_EMAIL));
        assert!(resolver(store).resolve(Some(&identity)).await.is_err());
    }

    #[test]
    fn only_the_latest_ticket_is_current() {
        let mut tracker = ResolutionTracker::default();
        let a = tracker.begin(Some(&Identity::new("a", None)));
        assert!(tracker.is_current(&a));
        let b = tracker.begin(Some(&Identity::new("b", None)));
        assert!(!tracker.is_current(&a));
        assert!(tracker.is_current(&b));
        let again = tracker.begin(Some(&Identity::new("a", None)));
        assert!(!tracker.is_current(&a));
        assert!(tracker.is_current(&again));
    }

    #[tokio::test(start_paused = true)]
    async fn stale_resolution_never_overwrites_newer_one() {
        let store = FakeStore::default()
            .with("slow", "slow@example.com", Role::Student, 10)
            .with("fast", "fast@example.com", Role::Teacher, 1);
        let auth = Arc::new(LocalAuth::new());
        auth.sign_in(Identity::new("slow", Some("slow@example.com")));

        let session = Arc::new(ProfileSession::new(Arc::clone(&auth), resolver(store)));
        let mut profile = session.profile();
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let runner = {
            let session = Arc::clone(&session);
            tokio::spawn(async move {
                session
                    .run(async {
                        let _ = stop_rx.await;
                    })
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(5)).await;
        auth.sign_in(Identity::new("fast", Some("fast@example.com")));

        let seen = profile.wait_for(|p| p.is_some()).await.unwrap().clone();
        assert_eq!(seen.map(|p| p.uid), Some("fast".to_string()));

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(session.current().map(|p| p.uid), Some("fast".to_string()));

        let _ = stop_tx.send(());
        runner.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn sign_out_clears_the_profile() {
        let store = FakeStore::default().with("u1", "a@example.com", Role::Student, 0);
        let auth = Arc::new(LocalAuth::new());
        auth.sign_in(Identity::new("u1", Some("a@example.com")));

        let session = Arc::new(ProfileSession::new(Arc::clone(&auth), resolver(store)));
        let mut profile = session.profile();
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let runner = {
            let session = Arc::clone(&session);
            tokio::spawn(async move {
                session
                    .run(async {
                        let _ = stop_rx.await;
                    })
                    .await
            })
        };

        profile.wait_for(|p| p.is_some()).await.unwrap();
        session.sign_out().await.unwrap();
        profile.wait_for(|p| p.is_none()).await.unwrap();
        assert_eq!(session.current(), None);

        let _ = stop_tx.send(());
        runner.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn failed_resolution_leaves_profile_absent() {
        let store = FakeStore {
            unreachable: true,
            ..FakeStore::default()
        };
        let auth = Arc::new(LocalAuth::new());
        auth.sign_in(Identity::new("u1", Some(DEFAULT_PRIVILEGED_EMAIL)));

        let session = ProfileSession::new(Arc::clone(&auth), resolver(store));
        session
            .run(tokio::time::sleep(Duration::from_secs(1)))
            .await;
        assert_eq!(session.current(), None);
    }
}
