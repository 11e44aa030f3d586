//! Login: connecting, racing failover partners, following routing.
//!
//! Two loops establish a physical connection:
//!
//! - [`login_no_failover`] retries one destination (following at most one
//!   routing redirect), with timeout slices that grow per attempt when parallel
//!   resolution is on;
//! - [`login_with_failover`] alternates between the primary and the failover
//!   partner, sleeping after each full pair.
//!
//! Both share [`attempt_one_login`], which connects, logs in, and validates the
//! acknowledgement.

use std::sync::Arc;
use std::time::Duration;

use mssql_auth::{AccessToken, Credentials, TokenProvider};
use mssql_driver_pool::{AuthContextKey, PoolGroup};
use parking_lot::Mutex;
use tds_rpc::TdsVersion;
use tokio::time::Instant;

use crate::config::Config;
use crate::connection::server_info::{RoutingInfo, ServerInfo};
use crate::connection::session_data::{AliasCache, SessionData};
use crate::connection::ConnectionState;
use crate::error::{Error, Result};
use crate::transport::{
    Connector, FeatureAck, LoginAck, LoginRequest, PhysicalConnection, SecurityOptions,
};

/// A point in time a login must finish by; `None` never expires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Deadline(Option<Instant>);

impl Deadline {
    pub(crate) fn after(timeout: Option<Duration>) -> Self {
        Self(timeout.map(|t| Instant::now() + t))
    }

    pub(crate) fn remaining(&self) -> Option<Duration> {
        self.0
            .map(|at| at.saturating_duration_since(Instant::now()))
    }

    pub(crate) fn is_expired(&self) -> bool {
        self.0.is_some_and(|at| Instant::now() >= at)
    }

    pub(crate) fn is_infinite(&self) -> bool {
        self.0.is_none()
    }

    /// A deadline `slice` from now, never later than this one.
    fn capped(&self, slice: Duration) -> Self {
        let end = Instant::now() + slice;
        Self(Some(match self.0 {
            Some(at) => at.min(end),
            None => end,
        }))
    }

    /// Whether at most `wait` is left. Never true for an infinite deadline.
    fn remaining_at_most(&self, wait: Duration) -> bool {
        self.remaining().is_some_and(|left| left <= wait)
    }
}

/// What a login needs from its logical connection.
pub(crate) struct LoginContext<'a> {
    pub config: &'a Config,
    pub connector: &'a dyn Connector,
    pub pool_group: &'a PoolGroup,
    pub token_provider: Option<&'a dyn TokenProvider>,
    pub recovery: Option<&'a SessionData>,
    pub aliases: &'a AliasCache,
    pub state: &'a Mutex<ConnectionState>,
}

/// A logged-in physical connection.
pub(crate) struct Established {
    pub physical: Arc<dyn PhysicalConnection>,
    pub ack: LoginAck,
    pub server: ServerInfo,
    pub session_data: SessionData,
    pub recovery_acknowledged: bool,
    pub data_source: String,
}

enum Attempt {
    Established(Established),
    Routed(RoutingInfo),
}

/// A failed attempt, with the failover partner the server named before failing.
struct AttemptError {
    error: Error,
    failover_partner: Option<String>,
}

impl From<Error> for AttemptError {
    fn from(error: Error) -> Self {
        Self {
            error,
            failover_partner: None,
        }
    }
}

impl LoginContext<'_> {
    fn set_state(&self, state: ConnectionState) {
        *self.state.lock() = state;
    }

    fn requests_session_recovery(&self) -> bool {
        self.config.connect_retry_count > 0
    }

    fn fresh_session_data(&self) -> SessionData {
        match self.recovery {
            Some(data) => data.clone(),
            None => SessionData::new(self.aliases.clone()),
        }
    }
}

/// Open a physical connection by `deadline`, choosing the failover or plain loop.
pub(crate) async fn open_physical(ctx: &LoginContext<'_>, deadline: Deadline) -> Result<Established> {
    let token = acquire_access_token(ctx).await?;

    let failover_partner = ctx
        .config
        .failover_partner
        .clone()
        .or_else(|| ctx.pool_group.failover_partner());

    let established = match failover_partner {
        Some(partner) => {
            let primary = ServerInfo::from_config(ctx.config);
            let use_failover = ctx.pool_group.use_failover_partner();
            login_with_failover(ctx, use_failover, primary, &partner, None, deadline, token.as_ref())
                .await?
        }
        None => login_no_failover(ctx, deadline, token.as_ref()).await?,
    };

    if let (Some(token), Credentials::Federated { authority, resource }) =
        (token, &ctx.config.credentials)
    {
        ctx.pool_group
            .auth_contexts()
            .merge(AuthContextKey::new(authority.as_ref(), resource.as_ref()), token);
    }
    ctx.set_state(ConnectionState::LoggedIn);
    Ok(established)
}

async fn acquire_access_token(ctx: &LoginContext<'_>) -> Result<Option<AccessToken>> {
    let Credentials::Federated { authority, resource } = &ctx.config.credentials else {
        return Ok(None);
    };
    let key = AuthContextKey::new(authority.as_ref(), resource.as_ref());
    if let Some(cached) = ctx.pool_group.auth_contexts().get(&key) {
        tracing::debug!(authority = %authority, "using cached authentication context");
        return Ok(Some(cached));
    }
    let provider = ctx.token_provider.ok_or_else(|| {
        Error::Config("federated credentials require a token provider".into())
    })?;
    Ok(Some(provider.acquire_token(authority, resource).await?))
}

/// Retry one destination until it accepts a login or the deadline passes.
async fn login_no_failover(
    ctx: &LoginContext<'_>,
    deadline: Deadline,
    token: Option<&AccessToken>,
) -> Result<Established> {
    let config = ctx.config;
    let backoff = &config.backoff;
    let original = ServerInfo::from_config(config);
    let mut server = original.clone();
    server.resolve_extended_name(&config.aliases, ctx.aliases);

    let parallel = config.is_parallel();
    let tnir = config.effective_tnir();
    let unit = backoff.parallel_unit(deadline.remaining().or(config.connect_timeout), tnir);

    let mut routing_attempts = 0u32;
    let mut attempt = 0u32;
    let mut sleep = backoff.initial;
    let mut server_partner: Option<String> = None;

    loop {
        attempt += 1;
        let attempt_deadline = if parallel {
            let multiplier = if tnir {
                1u32 << (attempt - 1).min(16)
            } else {
                attempt
            };
            let mut slice = unit * multiplier;
            if tnir && attempt == 1 && slice < backoff.tnir_first_attempt_floor {
                slice = backoff.tnir_first_attempt_floor;
            }
            deadline.capped(slice)
        } else {
            deadline
        };

        tracing::info!(
            host = %server.resolved_server_name,
            attempt,
            timeout_ms = attempt_deadline.remaining().map(|d| d.as_millis() as u64),
            "attempting login"
        );

        let failure = match attempt_one_login(ctx, &server, attempt_deadline, false, token).await {
            Ok(Attempt::Established(established)) => {
                let partner = established.ack.failover_partner.clone();
                if config.multi_subnet_failover && partner.is_some() {
                    established.physical.close().await;
                    return Err(Error::MultiSubnetFailoverWithPartner);
                }
                ctx.pool_group.set_failover_partner(partner);
                ctx.pool_group.failover_check(false);
                return Ok(Established {
                    data_source: original.user_server_name.clone(),
                    ..established
                });
            }
            Ok(Attempt::Routed(routing)) => {
                if routing_attempts > 0 {
                    return Err(Error::RecursiveRoutingNotSupported);
                }
                if deadline.is_expired() {
                    return Err(Error::RoutingAfterTimeout);
                }
                tracing::info!(
                    from = %server.resolved_server_name,
                    to = %routing.server_name,
                    port = routing.port,
                    "following routing redirect"
                );
                server = ServerInfo::routed(&routing, &original.user_server_name);
                ctx.set_state(ConnectionState::Routed);
                routing_attempts += 1;
                continue;
            }
            Err(failure) => failure,
        };

        if failure.failover_partner.is_some() {
            server_partner = failure.failover_partner.clone();
        }
        let error = failure.error;
        if !is_retryable_attempt_error(&error) || deadline.is_expired() {
            return Err(error);
        }
        if deadline.remaining_at_most(sleep) {
            return Err(error);
        }

        if let Some(partner) = server_partner.take() {
            if config.multi_subnet_failover {
                return Err(Error::MultiSubnetFailoverWithPartner);
            }
            tracing::info!(partner = %partner, "switching to server-provided failover partner");
            return login_with_failover(
                ctx,
                true,
                original,
                &partner,
                Some(partner.clone()),
                deadline,
                token,
            )
            .await;
        }

        tracing::debug!(attempt, sleep_ms = sleep.as_millis() as u64, error = %error, "login failed, backing off");
        tokio::time::sleep(sleep).await;
        sleep = backoff.next_sleep(sleep);
    }
}

/// Alternate between the primary and its failover partner.
async fn login_with_failover(
    ctx: &LoginContext<'_>,
    mut use_failover_host: bool,
    mut primary: ServerInfo,
    failover_host: &str,
    mut server_partner: Option<String>,
    deadline: Deadline,
    token: Option<&AccessToken>,
) -> Result<Established> {
    let config = ctx.config;
    let backoff = &config.backoff;
    let mut failover = ServerInfo::new(failover_host, config.protocol.clone());

    primary.resolve_extended_name(&config.aliases, ctx.aliases);
    if server_partner.is_none() {
        failover.resolve_extended_name(&config.aliases, ctx.aliases);
    }

    let unit = backoff.failover_unit(deadline.remaining().or(config.connect_timeout));
    let mut attempt = 0u32;
    let mut sleep = backoff.initial;

    let established = loop {
        let slice = unit * (attempt / 2 + 1);
        let attempt_deadline = deadline.capped(slice);

        let current = if use_failover_host {
            if let Some(partner) = &server_partner {
                if &failover.resolved_server_name != partner {
                    failover.set_derived_names(config.protocol.as_deref(), partner);
                }
            }
            &failover
        } else {
            &primary
        };

        tracing::info!(
            host = %current.resolved_server_name,
            attempt,
            failover = use_failover_host,
            timeout_ms = attempt_deadline.remaining().map(|d| d.as_millis() as u64),
            "attempting failover login"
        );

        match attempt_one_login(ctx, current, attempt_deadline, true, token).await {
            Ok(Attempt::Established(established)) => break established,
            Ok(Attempt::Routed(_)) => return Err(Error::UnexpectedRoutingInfo),
            Err(failure) => {
                if failure.failover_partner.is_some() {
                    server_partner = failure.failover_partner;
                }
                let error = failure.error;
                if !is_retryable_attempt_error(&error) || deadline.is_expired() {
                    return Err(error);
                }
                if attempt % 2 == 1 && deadline.remaining_at_most(sleep) {
                    return Err(error);
                }
                tracing::debug!(attempt, error = %error, "failover login attempt failed");
            }
        }

        if attempt % 2 == 1 {
            tracing::debug!(sleep_ms = sleep.as_millis() as u64, "both partners failed, backing off");
            tokio::time::sleep(sleep).await;
            sleep = backoff.next_sleep(sleep);
        }
        attempt += 1;
        use_failover_host = !use_failover_host;
    };

    let partner = established
        .ack
        .failover_partner
        .clone()
        .or(server_partner);
    if use_failover_host && partner.is_none() {
        established.physical.close().await;
        return Err(Error::InvalidPartnerConfiguration {
            partner: failover_host.to_string(),
            database: established.session_data.database.clone().unwrap_or_default(),
        });
    }
    ctx.pool_group.set_failover_partner(partner);
    ctx.pool_group.failover_check(use_failover_host);

    let data_source = if use_failover_host {
        failover_host.to_string()
    } else {
        primary.user_server_name.clone()
    };
    Ok(Established {
        data_source,
        ..established
    })
}

/// Whether a failed attempt may be followed by another.
///
/// Transport and server login failures close the physical connection and can
/// be retried; protocol-logic failures and non-retryable logins cannot.
fn is_retryable_attempt_error(error: &Error) -> bool {
    !error.is_do_not_retry_login()
        && !error.is_protocol_error()
        && !error.is_usage_error()
        && error.is_catchable()
        && !matches!(error, Error::Auth(_) | Error::OperationCancelled)
}

async fn attempt_one_login(
    ctx: &LoginContext<'_>,
    server: &ServerInfo,
    deadline: Deadline,
    with_failover: bool,
    token: Option<&AccessToken>,
) -> std::result::Result<Attempt, AttemptError> {
    let work = connect_and_login(ctx, server, deadline, with_failover, token);
    match deadline.remaining() {
        Some(remaining) => tokio::time::timeout(remaining, work)
            .await
            .unwrap_or_else(|_| Err(AttemptError::from(Error::ConnectionTimeout))),
        None => work.await,
    }
}

async fn connect_and_login(
    ctx: &LoginContext<'_>,
    server: &ServerInfo,
    deadline: Deadline,
    with_failover: bool,
    token: Option<&AccessToken>,
) -> std::result::Result<Attempt, AttemptError> {
    ctx.set_state(ConnectionState::Connecting);
    let physical = ctx
        .connector
        .connect(server, deadline.remaining(), SecurityOptions::from(ctx.config))
        .await?;

    ctx.set_state(ConnectionState::LoggingIn);
    let request = login_request(ctx, server, token);
    let ack = match physical.login(&request).await {
        Ok(ack) => ack,
        Err(error) => {
            let failover_partner = physical.server_failover_partner();
            physical.close().await;
            return Err(AttemptError {
                error,
                failover_partner,
            });
        }
    };

    match complete_login(ctx, &request, &ack, with_failover) {
        Ok(Some((session_data, recovery_acknowledged))) => {
            Ok(Attempt::Established(Established {
                physical,
                server: server.clone(),
                session_data,
                recovery_acknowledged,
                data_source: server.user_server_name.clone(),
                ack,
            }))
        }
        Ok(None) => {
            physical.close().await;
            match ack.routing {
                Some(routing) => Ok(Attempt::Routed(routing)),
                None => Err(Error::Protocol("routing without destination".into()).into()),
            }
        }
        Err(error) => {
            physical.close().await;
            Err(error.into())
        }
    }
}

fn login_request(ctx: &LoginContext<'_>, server: &ServerInfo, token: Option<&AccessToken>) -> LoginRequest {
    let config = ctx.config;
    LoginRequest {
        server_name: server.resolved_server_name.clone(),
        database: config.database.clone(),
        language: config.language.clone(),
        application_name: config.application_name.clone(),
        credentials: config.credentials.clone(),
        access_token: token.map(|t| t.token.clone()),
        packet_size: config.packet_size,
        tds_version: TdsVersion::V7_4,
        request_session_recovery: ctx.requests_session_recovery(),
        recovery: ctx.recovery.cloned(),
        column_encryption: config.column_encryption,
    }
}

/// Validate a login acknowledgement.
///
/// Returns `None` for a routing reply, whose feature acknowledgements and
/// session state do not apply.
fn complete_login(
    ctx: &LoginContext<'_>,
    request: &LoginRequest,
    ack: &LoginAck,
    with_failover: bool,
) -> Result<Option<(SessionData, bool)>> {
    if ack.routing.is_some() {
        if with_failover {
            return Err(Error::UnexpectedRoutingInfo);
        }
        return Ok(None);
    }

    let recovering = ctx.recovery.is_some();
    let mut data = ctx.fresh_session_data();
    let mut recovery_acknowledged = false;
    let mut fed_auth_acknowledged = false;

    for feature in &ack.feature_acks {
        match feature {
            FeatureAck::SessionRecovery(state) => {
                if !request.request_session_recovery {
                    return Err(Error::UnrequestedFeatureAck(feature.id()));
                }
                recovery_acknowledged = true;
                data.apply_recovery_ack(state, recovering)?;
            }
            FeatureAck::FederatedAuth => {
                if request.access_token.is_none() {
                    return Err(Error::UnrequestedFeatureAck(feature.id()));
                }
                fed_auth_acknowledged = true;
            }
            FeatureAck::ColumnEncryption(version) => {
                if !request.column_encryption {
                    return Err(Error::UnrequestedFeatureAck(feature.id()));
                }
                if *version == 0 {
                    return Err(Error::Protocol("invalid column encryption version 0".into()));
                }
            }
            FeatureAck::Other(id, _) => return Err(Error::UnrequestedFeatureAck(*id)),
        }
    }

    if let Some(recovery) = ctx.recovery {
        if recovery.tds_version != ack.tds_version {
            return Err(Error::SessionRecoveryVersionMismatch {
                expected: recovery.tds_version,
                actual: ack.tds_version,
            });
        }
    }
    data.tds_version = ack.tds_version;

    if let Some(db) = &ack.database {
        data.database = Some(db.clone());
    }
    if let Some(lang) = &ack.language {
        data.language = Some(lang.clone());
    }
    if let Some(collation) = &ack.collation {
        data.collation = Some(collation.clone());
    }

    if request.access_token.is_some() && !fed_auth_acknowledged {
        return Err(Error::FederatedAuthNotAcknowledged);
    }

    if !recovery_acknowledged && recovering {
        return Err(Error::SessionRecoveryNotAcknowledged);
    }
    if !recovering {
        data.capture_initial();
    }

    if let Some(recovery) = ctx.recovery {
        if recovery.encrypted != ack.encrypted {
            return Err(Error::EncryptionChangedOnReconnect);
        }
    }
    data.encrypted = ack.encrypted;

    Ok(Some((data, recovery_acknowledged)))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_deadline_remaining_and_expiry() {
        let deadline = Deadline::after(Some(Duration::from_secs(2)));
        assert!(!deadline.is_expired());
        tokio::time::advance(Duration::from_millis(1500)).await;
        assert_eq!(deadline.remaining(), Some(Duration::from_millis(500)));
        assert!(deadline.remaining_at_most(Duration::from_millis(500)));
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(deadline.is_expired());
    }

    #[tokio::test(start_paused = true)]
    async fn test_capped_never_exceeds_overall() {
        let deadline = Deadline::after(Some(Duration::from_secs(1)));
        let slice = deadline.capped(Duration::from_secs(5));
        assert_eq!(slice.remaining(), Some(Duration::from_secs(1)));

        let infinite = Deadline::after(None);
        assert!(infinite.is_infinite());
        assert!(!infinite.remaining_at_most(Duration::from_secs(3600)));
        assert_eq!(infinite.capped(Duration::from_secs(2)).remaining(), Some(Duration::from_secs(2)));
    }

    #[test]
    fn test_retryable_attempt_errors() {
        assert!(is_retryable_attempt_error(&Error::ConnectionTimeout));
        assert!(is_retryable_attempt_error(&Error::from(&crate::error::ServerMessage::new(
            4060, 11, "db"
        ))));
        assert!(!is_retryable_attempt_error(&Error::from(&crate::error::ServerMessage::new(
            crate::error::LOGON_FAILED,
            14,
            "bad login"
        ))));
        assert!(!is_retryable_attempt_error(&Error::SessionRecoveryNotAcknowledged));
        assert!(!is_retryable_attempt_error(&Error::Fatal("oom".into())));
    }
}
