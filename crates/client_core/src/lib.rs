use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, PoisonError, RwLock,
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use reqwest::{multipart, Client, StatusCode};
use shared::{
    domain::UserId,
    error::ApiError,
    protocol::{AvatarUploadResponse, Credentials, SessionUser},
};
use thiserror::Error;
use tokio::{
    sync::{broadcast, Mutex},
    task::JoinHandle,
};
use tracing::{debug, info, warn};
use url::Url;

pub mod staging;

pub use staging::{
    CandidateFile, FileStaging, InMemoryPreviewRegistry, PreviewHandle, PreviewRegistry,
    StagedFile, StagingError, UploadPayload,
};

const LOGIN_FALLBACK_MESSAGE: &str = "Sign-in failed; check your connection and try again.";
const REGISTRATION_FALLBACK_MESSAGE: &str =
    "Registration failed; check your connection and try again.";
const AVATAR_UPLOAD_FALLBACK_MESSAGE: &str = "Failed to update profile photo.";
const PROFILE_REFRESH_FAILURE_MESSAGE: &str =
    "Profile photo updated, but refreshing your profile failed.";
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Global session/profile store boundary. The store owns the authenticated
/// user and is written only with data returned by a successful mutation or a
/// successful refetch, never with an optimistic guess.
pub trait SessionStore: Send + Sync {
    fn read(&self) -> Option<SessionUser>;
    fn write(&self, user: SessionUser);
    fn clear(&self);
}

#[derive(Default)]
pub struct InMemorySessionStore {
    user: RwLock<Option<SessionUser>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStore for InMemorySessionStore {
    fn read(&self) -> Option<SessionUser> {
        self.user
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn write(&self, user: SessionUser) {
        *self.user.write().unwrap_or_else(PoisonError::into_inner) = Some(user);
    }

    fn clear(&self) {
        *self.user.write().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

/// Toast/notification surface. Fire-and-forget; the core never reads back.
pub trait FeedbackSink: Send + Sync {
    fn notify_success(&self, message: &str);
    fn notify_error(&self, message: &str);
}

/// Discards all feedback. Stands in when no notification surface is wired.
pub struct NullFeedbackSink;

impl FeedbackSink for NullFeedbackSink {
    fn notify_success(&self, _message: &str) {}

    fn notify_error(&self, _message: &str) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    Anonymous,
    Authenticating,
    Authenticated,
}

#[derive(Debug, Clone)]
pub enum ClientEvent {
    AuthStateChanged(AuthState),
    SessionUpdated(SessionUser),
    Error(String),
}

/// Outcome of one remote mutation, consumed exactly once to decide the next
/// action.
#[derive(Debug, Error)]
pub enum MutationError {
    /// The server handled the request and rejected it.
    #[error("server rejected request: status {status}")]
    Rejected {
        status: StatusCode,
        message: Option<String>,
    },
    /// The request never produced a server verdict.
    #[error("transport failure: {0}")]
    Transport(#[from] reqwest::Error),
}

impl MutationError {
    /// Message to surface to the user: the server-provided one when present,
    /// the per-flow fallback otherwise.
    pub fn user_message<'a>(&'a self, fallback: &'a str) -> &'a str {
        match self {
            Self::Rejected {
                message: Some(message),
                ..
            } => message,
            _ => fallback,
        }
    }
}

#[derive(Debug, Error)]
pub enum LoginError {
    #[error("email and password must both be provided")]
    EmptyCredentials,
    #[error("a sign-in attempt is already in flight")]
    InFlight,
    #[error("invalid server url: {0}")]
    InvalidServerUrl(#[from] url::ParseError),
    #[error(transparent)]
    Mutation(#[from] MutationError),
}

#[derive(Debug, Error)]
pub enum RefreshError {
    #[error("not signed in: {0}")]
    NoSession(String),
    #[error(transparent)]
    Mutation(#[from] MutationError),
}

#[derive(Debug, Error)]
pub enum AvatarSubmitError {
    #[error("no file is staged for upload")]
    NothingStaged,
    #[error("an upload is already in flight")]
    InFlight,
    #[error("not signed in: {0}")]
    NoSession(String),
    #[error(transparent)]
    Mutation(#[from] MutationError),
    /// The upload itself succeeded; resynchronizing the profile did not.
    #[error("profile refresh after upload failed: {0}")]
    Refresh(RefreshError),
}

/// Single-slot admission token for one submission control. A gesture must
/// take the slot before issuing its request; the guard returns it when the
/// gesture resolves, and a held slot rejects further submissions instead of
/// racing them.
struct InflightSlot {
    busy: AtomicBool,
}

impl InflightSlot {
    fn new() -> Self {
        Self {
            busy: AtomicBool::new(false),
        }
    }

    fn try_acquire(&self) -> Option<InflightGuard<'_>> {
        if self
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            Some(InflightGuard { slot: self })
        } else {
            None
        }
    }

    fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }
}

struct InflightGuard<'a> {
    slot: &'a InflightSlot,
}

impl Drop for InflightGuard<'_> {
    fn drop(&mut self) {
        self.slot.busy.store(false, Ordering::Release);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CredentialFlow {
    Login,
    Registration,
}

impl CredentialFlow {
    fn path(self) -> &'static str {
        match self {
            Self::Login => "login",
            Self::Registration => "registration",
        }
    }

    fn fallback_message(self) -> &'static str {
        match self {
            Self::Login => LOGIN_FALLBACK_MESSAGE,
            Self::Registration => REGISTRATION_FALLBACK_MESSAGE,
        }
    }
}

/// Surface-facing API of the account client, for UI shells that hold the
/// client behind a trait object.
#[async_trait]
pub trait AccountHandle: Send + Sync {
    async fn login(&self, server_url: &str, credentials: Credentials) -> Result<SessionUser>;
    async fn register(&self, server_url: &str, credentials: Credentials) -> Result<SessionUser>;
    async fn logout(&self) -> Result<()>;
    async fn refresh_user_info(&self) -> Result<SessionUser>;
    async fn session_user(&self) -> Option<SessionUser>;
    fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent>;
}

struct AccountSessionState {
    server_url: Option<Url>,
    auth: AuthState,
}

pub struct AccountClient {
    http: Client,
    store: Arc<dyn SessionStore>,
    feedback: Arc<dyn FeedbackSink>,
    inner: Mutex<AccountSessionState>,
    credential_slot: InflightSlot,
    events: broadcast::Sender<ClientEvent>,
}

impl AccountClient {
    pub fn new() -> Arc<Self> {
        Self::new_with_dependencies(
            Arc::new(InMemorySessionStore::new()),
            Arc::new(NullFeedbackSink),
        )
    }

    pub fn new_with_dependencies(
        store: Arc<dyn SessionStore>,
        feedback: Arc<dyn FeedbackSink>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Arc::new(Self {
            http: Client::new(),
            store,
            feedback,
            inner: Mutex::new(AccountSessionState {
                server_url: None,
                auth: AuthState::Anonymous,
            }),
            credential_slot: InflightSlot::new(),
            events,
        })
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    pub async fn auth_state(&self) -> AuthState {
        self.inner.lock().await.auth
    }

    pub fn session_user(&self) -> Option<SessionUser> {
        self.store.read()
    }

    pub fn login_in_flight(&self) -> bool {
        self.credential_slot.is_busy()
    }

    pub async fn login(
        &self,
        server_url: &str,
        credentials: Credentials,
    ) -> Result<SessionUser, LoginError> {
        self.submit_credentials(server_url, credentials, CredentialFlow::Login)
            .await
    }

    pub async fn register(
        &self,
        server_url: &str,
        credentials: Credentials,
    ) -> Result<SessionUser, LoginError> {
        self.submit_credentials(server_url, credentials, CredentialFlow::Registration)
            .await
    }

    /// Clears the session: the store is emptied and the gate returns to
    /// `Anonymous`.
    pub async fn logout(&self) {
        {
            let mut guard = self.inner.lock().await;
            guard.server_url = None;
        }
        self.store.clear();
        self.set_auth_state(AuthState::Anonymous).await;
        info!("auth: session cleared");
    }

    /// Refetches the canonical user resource and overwrites the store slice
    /// with the result. Runs after mutations whose acknowledgement does not
    /// carry the updated profile.
    pub async fn refresh_user_info(&self) -> Result<SessionUser, RefreshError> {
        let (server_url, user_id) = self
            .session()
            .await
            .map_err(|err| RefreshError::NoSession(err.to_string()))?;

        let response = self
            .http
            .get(endpoint(&server_url, "users/info"))
            .query(&[("user_id", user_id.0)])
            .send()
            .await
            .map_err(MutationError::from)?;
        let user: SessionUser = decode_json_response(response).await?;

        self.commit_session_user(user.clone());
        info!(user_id = user.user_id.0, "profile: session user refreshed");
        Ok(user)
    }

    pub fn begin_avatar_change(
        self: &Arc<Self>,
        previews: Arc<dyn PreviewRegistry>,
    ) -> Arc<AvatarChange> {
        Arc::new(AvatarChange {
            client: Arc::clone(self),
            staging: Mutex::new(FileStaging::new(previews)),
            upload_slot: InflightSlot::new(),
            closed: AtomicBool::new(false),
            submit_task: Mutex::new(None),
        })
    }

    async fn submit_credentials(
        &self,
        server_url: &str,
        credentials: Credentials,
        flow: CredentialFlow,
    ) -> Result<SessionUser, LoginError> {
        if credentials.email.trim().is_empty() || credentials.password.is_empty() {
            return Err(LoginError::EmptyCredentials);
        }
        let Some(_guard) = self.credential_slot.try_acquire() else {
            debug!(?flow, "auth: submission rejected while another is in flight");
            return Err(LoginError::InFlight);
        };
        let base = parse_server_url(server_url)?;

        self.set_auth_state(AuthState::Authenticating).await;

        match self.post_credentials(&base, flow, &credentials).await {
            Ok(user) => {
                {
                    let mut guard = self.inner.lock().await;
                    guard.server_url = Some(base);
                }
                self.commit_session_user(user.clone());
                self.set_auth_state(AuthState::Authenticated).await;
                info!(user_id = user.user_id.0, ?flow, "auth: session established");
                Ok(user)
            }
            Err(err) => {
                self.set_auth_state(AuthState::Anonymous).await;
                self.feedback
                    .notify_error(err.user_message(flow.fallback_message()));
                warn!(?flow, "auth: submission failed: {err}");
                Err(LoginError::Mutation(err))
            }
        }
    }

    async fn post_credentials(
        &self,
        base: &Url,
        flow: CredentialFlow,
        credentials: &Credentials,
    ) -> Result<SessionUser, MutationError> {
        let response = self
            .http
            .post(endpoint(base, flow.path()))
            .json(credentials)
            .send()
            .await?;
        decode_json_response(response).await
    }

    async fn post_avatar(
        &self,
        server_url: &Url,
        user_id: UserId,
        payload: UploadPayload,
    ) -> Result<AvatarUploadResponse, MutationError> {
        let part = multipart::Part::bytes(payload.bytes)
            .file_name(payload.filename)
            .mime_str(&payload.media_type)?;
        let form = multipart::Form::new().part("file", part);
        let response = self
            .http
            .post(endpoint(server_url, "users/avatar"))
            .query(&[("user_id", user_id.0)])
            .multipart(form)
            .send()
            .await?;
        decode_json_response(response).await
    }

    async fn session(&self) -> Result<(Url, UserId)> {
        let server_url = {
            let guard = self.inner.lock().await;
            guard
                .server_url
                .clone()
                .ok_or_else(|| anyhow!("not signed in: missing server url"))?
        };
        let user = self
            .store
            .read()
            .ok_or_else(|| anyhow!("not signed in: missing session user"))?;
        Ok((server_url, user.user_id))
    }

    fn commit_session_user(&self, user: SessionUser) {
        self.store.write(user.clone());
        let _ = self.events.send(ClientEvent::SessionUpdated(user));
    }

    async fn set_auth_state(&self, next: AuthState) {
        let changed = {
            let mut guard = self.inner.lock().await;
            if guard.auth == next {
                false
            } else {
                guard.auth = next;
                true
            }
        };
        if changed {
            let _ = self.events.send(ClientEvent::AuthStateChanged(next));
        }
    }
}

#[async_trait]
impl AccountHandle for Arc<AccountClient> {
    async fn login(&self, server_url: &str, credentials: Credentials) -> Result<SessionUser> {
        Ok(AccountClient::login(self, server_url, credentials).await?)
    }

    async fn register(&self, server_url: &str, credentials: Credentials) -> Result<SessionUser> {
        Ok(AccountClient::register(self, server_url, credentials).await?)
    }

    async fn logout(&self) -> Result<()> {
        AccountClient::logout(self).await;
        Ok(())
    }

    async fn refresh_user_info(&self) -> Result<SessionUser> {
        Ok(AccountClient::refresh_user_info(self).await?)
    }

    async fn session_user(&self) -> Option<SessionUser> {
        AccountClient::session_user(self)
    }

    fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        AccountClient::subscribe_events(self)
    }
}

/// One avatar-change surface (the modal, in UI terms). Owns the staged file
/// and its preview for the surface's lifetime, plus any detached submission
/// it spawned; [`close`] tears all of it down.
///
/// [`close`]: Self::close
pub struct AvatarChange {
    client: Arc<AccountClient>,
    staging: Mutex<FileStaging>,
    upload_slot: InflightSlot,
    closed: AtomicBool,
    submit_task: Mutex<Option<JoinHandle<()>>>,
}

impl AvatarChange {
    /// Stages the first image from a drop/pick gesture, replacing any
    /// previously staged file wholesale. Returns the preview reference for
    /// the staged file, if one is held after the call.
    pub async fn stage_files(
        &self,
        files: Vec<CandidateFile>,
    ) -> Result<Option<String>, StagingError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StagingError::SurfaceClosed);
        }
        self.staging.lock().await.stage(files)
    }

    pub async fn staged_preview(&self) -> Option<String> {
        self.staging
            .lock()
            .await
            .preview_url()
            .map(str::to_owned)
    }

    /// Whether the submit control should be offered: a file is staged and no
    /// upload is in flight.
    pub async fn can_submit(&self) -> bool {
        !self.upload_slot.is_busy() && self.staging.lock().await.is_staged()
    }

    /// Uploads the staged file, then resynchronizes the session store from
    /// the canonical user resource. The store is written only with the
    /// refetched profile, never with the upload acknowledgement.
    pub async fn submit(&self) -> Result<SessionUser, AvatarSubmitError> {
        let Some(_guard) = self.upload_slot.try_acquire() else {
            debug!("avatar: submit rejected while an upload is in flight");
            return Err(AvatarSubmitError::InFlight);
        };

        let payload = {
            let mut staging = self.staging.lock().await;
            staging
                .begin_submit()
                .ok_or(AvatarSubmitError::NothingStaged)?
        };

        match self.submit_payload(payload).await {
            Ok(user) => {
                self.staging.lock().await.finish_submit();
                Ok(user)
            }
            Err(err) => {
                match &err {
                    // The upload itself went through; the staged file is spent.
                    AvatarSubmitError::Refresh(_) => self.staging.lock().await.finish_submit(),
                    _ => self.staging.lock().await.fail_submit(),
                }
                Err(err)
            }
        }
    }

    /// Fire-and-forget submission for surfaces that cannot await. The task
    /// is owned by this surface and aborted on [`close`]; failures surface
    /// on the client event channel.
    ///
    /// [`close`]: Self::close
    pub async fn spawn_submit(self: &Arc<Self>) {
        let mut slot = self.submit_task.lock().await;
        if slot.as_ref().is_some_and(|task| !task.is_finished()) {
            let _ = self
                .client
                .events
                .send(ClientEvent::Error(AvatarSubmitError::InFlight.to_string()));
            return;
        }
        let surface = Arc::clone(self);
        *slot = Some(tokio::spawn(async move {
            if let Err(err) = surface.submit().await {
                let _ = surface.client.events.send(ClientEvent::Error(err.to_string()));
            }
        }));
    }

    /// Tears the surface down: releases the staged file and its preview, and
    /// aborts an in-flight detached submission so it cannot write the store
    /// after the surface is gone.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        if let Some(task) = self.submit_task.lock().await.take() {
            task.abort();
        }
        self.staging.lock().await.clear();
        debug!("avatar: surface closed");
    }

    async fn submit_payload(&self, payload: UploadPayload) -> Result<SessionUser, AvatarSubmitError> {
        let (server_url, user_id) = self
            .client
            .session()
            .await
            .map_err(|err| AvatarSubmitError::NoSession(err.to_string()))?;

        let ack = match self.client.post_avatar(&server_url, user_id, payload).await {
            Ok(ack) => ack,
            Err(err) => {
                self.client
                    .feedback
                    .notify_error(err.user_message(AVATAR_UPLOAD_FALLBACK_MESSAGE));
                warn!(user_id = user_id.0, "avatar: upload failed: {err}");
                return Err(AvatarSubmitError::Mutation(err));
            }
        };

        if ack.status != 200 {
            let err = MutationError::Rejected {
                status: StatusCode::from_u16(ack.status)
                    .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
                message: Some(ack.message),
            };
            self.client
                .feedback
                .notify_error(err.user_message(AVATAR_UPLOAD_FALLBACK_MESSAGE));
            warn!(user_id = user_id.0, "avatar: upload not acknowledged: {err}");
            return Err(AvatarSubmitError::Mutation(err));
        }

        info!(user_id = user_id.0, "avatar: upload acknowledged");
        self.client.feedback.notify_success(&ack.message);

        // The acknowledgement carries no profile data; the store is only
        // written after the canonical resource is refetched.
        match AccountClient::refresh_user_info(&self.client).await {
            Ok(user) => Ok(user),
            Err(err) => {
                self.client
                    .feedback
                    .notify_error(PROFILE_REFRESH_FAILURE_MESSAGE);
                warn!(user_id = user_id.0, "avatar: refresh after upload failed: {err}");
                Err(AvatarSubmitError::Refresh(err))
            }
        }
    }
}

/// Normalizes the server URL so endpoint paths can be appended directly.
fn parse_server_url(raw: &str) -> Result<Url, url::ParseError> {
    let mut url = Url::parse(raw)?;
    if !url.path().ends_with('/') {
        url.set_path(&format!("{}/", url.path()));
    }
    Ok(url)
}

fn endpoint(base: &Url, path: &str) -> String {
    format!("{base}{path}")
}

/// Decodes a 2xx body as `T`. Non-2xx bodies are read as the API error
/// envelope when they parse as one, so the server-provided message can be
/// surfaced; anything else keeps only the status.
async fn decode_json_response<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T, MutationError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response.json().await?);
    }
    let message = match response.text().await {
        Ok(body) => serde_json::from_str::<ApiError>(&body)
            .ok()
            .map(|envelope| envelope.message),
        Err(_) => None,
    };
    Err(MutationError::Rejected { status, message })
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
