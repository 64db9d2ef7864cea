//! The per-subject OT client: domain discovery, OTVID acquisition and
//! caching, and authenticated service calls.

use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, SystemTime};

use reqwest::header::HeaderMap;
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::debug;

use crate::cache::{Cache, Entry, RenewState};
use crate::endpoint::select_endpoints;
use crate::error::Error;
use crate::http::{add_token_to_headers, HttpClient};
use crate::keys::{lookup_signing_key, Key, KeySet};
use crate::otid::{Otid, TrustDomain};
use crate::otvid::Otvid;
use crate::types::{DiscoveryDocument, DomainConfig, Response, ServiceConfig, SignInput, SignOutput};

/// Fallback refresh interval when the authority gives no hint.
const DEFAULT_REFRESH: Duration = Duration::from_secs(3600);

/// Domain configurations live at least this long.
const MIN_CONFIG_TTL: Duration = Duration::from_secs(3600);

/// Default lifetime of self-signed OTVIDs.
const DEFAULT_SELF_TTL: Duration = Duration::from_secs(600);

type ErrorCallback = Arc<dyn Fn(&Error) + Send + Sync>;

#[derive(Clone)]
struct DomainState {
    td: TrustDomain,
    keys: Option<Arc<KeySet>>,
    endpoint: String,
    expires_at: Option<SystemTime>,
}

impl RenewState for DomainState {
    type Value = DomainConfig;

    fn snapshot(&self) -> DomainConfig {
        DomainConfig {
            otid: self.td.otid(),
            keys: self.keys.clone(),
            endpoint: self.endpoint.clone(),
        }
    }

    fn should_renew(&self) -> bool {
        self.endpoint.is_empty()
            || self.keys.is_none()
            || self.expires_at.is_none_or(|t| SystemTime::now() > t)
    }
}

fn domain_state(id: &Otid) -> DomainState {
    DomainState {
        td: id.trust_domain().clone(),
        keys: None,
        endpoint: String::new(),
        expires_at: None,
    }
}

#[derive(Clone)]
struct ServiceState {
    aud: Otid,
    vid: Option<Arc<Otvid>>,
    endpoint: String,
}

impl RenewState for ServiceState {
    type Value = ServiceConfig;

    fn snapshot(&self) -> ServiceConfig {
        ServiceConfig {
            otvid: self.vid.clone(),
            endpoint: self.endpoint.clone(),
        }
    }

    fn should_renew(&self) -> bool {
        self.endpoint.is_empty() || self.vid.as_ref().is_none_or(|v| v.should_renew())
    }
}

fn service_state(id: &Otid) -> ServiceState {
    ServiceState {
        aud: id.clone(),
        vid: None,
        endpoint: String::new(),
    }
}

struct ClientInner {
    http: HttpClient,
    td: TrustDomain,
    sub: Otid,
    private_keys: RwLock<Option<Arc<KeySet>>>,
    domain_keys: RwLock<Option<Arc<KeySet>>>,
    domains: Cache<DomainState>,
    services: Cache<ServiceState>,
    refresh: RwLock<Duration>,
    on_error: RwLock<Option<ErrorCallback>>,
}

/// A per-subject Open Trust client.
///
/// The client keeps a live, verified population of OTVIDs and domain
/// configurations available behind cheaply clonable handles. All exposed
/// operations may be called concurrently.
#[derive(Clone)]
pub struct OtClient {
    inner: Arc<ClientInner>,
}

impl OtClient {
    /// Create a client for the given subject OTID.
    pub fn new(sub: Otid) -> Result<Self, Error> {
        Self::with_http_client(sub, HttpClient::new()?)
    }

    /// Create a client with a preconfigured HTTP client (custom headers,
    /// transport, or a constraint endpoint for tests).
    pub fn with_http_client(sub: Otid, http: HttpClient) -> Result<Self, Error> {
        sub.validate()?;
        let td = sub.trust_domain().clone();
        Ok(Self {
            inner: Arc::new(ClientInner {
                http,
                td,
                sub,
                private_keys: RwLock::new(None),
                domain_keys: RwLock::new(None),
                domains: Cache::new(domain_state),
                services: Cache::new(service_state),
                refresh: RwLock::new(DEFAULT_REFRESH),
                on_error: RwLock::new(None),
            }),
        })
    }

    /// The subject this client speaks for.
    pub fn subject(&self) -> &Otid {
        &self.inner.sub
    }

    /// The subject's trust domain.
    pub fn trust_domain(&self) -> &TrustDomain {
        &self.inner.td
    }

    /// The underlying HTTP client.
    pub fn http_client(&self) -> &HttpClient {
        &self.inner.http
    }

    /// Statically configure the domain's public keys, bypassing discovery.
    pub fn set_domain_keys(&self, keys: KeySet) {
        *write_lock(&self.inner.domain_keys) = Some(Arc::new(keys));
    }

    /// Configure the subject's private keys, enabling self-signing.
    pub fn set_private_keys(&self, keys: KeySet) {
        *write_lock(&self.inner.private_keys) = Some(Arc::new(keys));
    }

    /// Register a callback receiving background refresh failures.
    pub fn set_on_error(&self, callback: impl Fn(&Error) + Send + Sync + 'static) {
        *write_lock(&self.inner.on_error) = Some(Arc::new(callback));
    }

    /// Produce a short-lived OTVID `subject -> subject's trust domain`,
    /// signed with the subject's own private key. Used as the bearer
    /// credential when talking to the authority.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidKey`] when no private keys are configured.
    pub fn sign_self(&self, exp: Option<Duration>) -> Result<String, Error> {
        let keys = read_lock(&self.inner.private_keys).clone().ok_or_else(|| {
            Error::InvalidKey("OtClient::sign_self: no private keys configured".to_string())
        })?;
        let key = lookup_signing_key(&keys)?;

        let mut vid = Otvid::new(
            self.inner.sub.clone(),
            self.inner.sub.clone(),
            self.inner.td.otid(),
        );
        vid.expiry = Some(SystemTime::now() + exp.unwrap_or(DEFAULT_SELF_TTL));
        vid.sign(key)
    }

    /// Request an OTVID from the authority's `/sign` endpoint,
    /// authenticating with a fresh self-signed token.
    pub async fn sign(&self, input: SignInput) -> Result<SignOutput, Error> {
        let domain = self.resolve_domain().await?;
        if domain.endpoint.is_empty() {
            return Err(Error::Discovery(
                "OtClient::sign: no authority service endpoint".to_string(),
            ));
        }
        let self_token = self.sign_self(None)?;
        let mut headers = HeaderMap::new();
        add_token_to_headers(&mut headers, &self_token);

        let resp: Response<SignOutput> = self
            .inner
            .http
            .request(
                Method::POST,
                &format!("{}/sign", domain.endpoint),
                Some(headers),
                Some(&input),
            )
            .await?;
        resp.into_result()
    }

    /// Verify a token with the authority's `/verify` endpoint, returning
    /// the authority's authoritative parse. The audience defaults to this
    /// client's subject.
    pub async fn verify(&self, token: &str, aud: Option<Otid>) -> Result<Otvid, Error> {
        let aud = aud.unwrap_or_else(|| self.inner.sub.clone());
        let input = serde_json::json!({
            "aud": aud.to_string(),
            "otvid": token,
        });

        let service = self.service(self.inner.td.otid()).await?;
        let resp: Response<Map<String, Value>> = service
            .request(Method::POST, "/verify", None, Some(&input))
            .await?;
        Otvid::from_claims(token, resp.into_result()?)
    }

    /// Parse and verify a token locally against the domain keyset. When the
    /// token carries a release id and the authority endpoint is known, the
    /// call is promoted to [`OtClient::verify`]. The audience defaults to
    /// this client's subject.
    pub async fn parse_otvid(&self, token: &str, aud: Option<Otid>) -> Result<Otvid, Error> {
        let aud = aud.unwrap_or_else(|| self.inner.sub.clone());
        let (keys, endpoint) = self.domain_material().await?;
        let vid = Otvid::parse(token, &keys, &self.inner.td.otid(), &aud)?;
        if vid.maybe_revoked() && !endpoint.is_empty() {
            return self.verify(token, Some(aud)).await;
        }
        Ok(vid)
    }

    /// A client for calling the given audience with the subject's OTVID as
    /// bearer credential.
    pub async fn service(&self, aud: Otid) -> Result<ServiceClient, Error> {
        aud.validate()?;
        let entry = self.inner.services.get(&aud).await;
        Ok(ServiceClient {
            client: self.clone(),
            audience: aud,
            entry,
        })
    }

    /// A resolver for the given trust domain's configuration.
    pub async fn domain(&self, td: &TrustDomain) -> Result<DomainResolver, Error> {
        td.validate()?;
        let entry = self.inner.domains.get(&td.otid()).await;
        Ok(DomainResolver {
            client: self.clone(),
            entry,
        })
    }

    /// Seed the audience cache with a pre-issued OTVID obtained out of
    /// band. The token must belong to this client's subject and must not
    /// yet need renewal.
    pub async fn add_audience(&self, token: &str, endpoint: &str) -> Result<(), Error> {
        let vid = Otvid::parse_insecure(token)?;
        if vid.id != self.inner.sub {
            return Err(Error::ClaimMismatch(format!(
                "OtClient::add_audience: the OTVID {} does not belong to subject {}",
                vid.id, self.inner.sub
            )));
        }
        if vid.should_renew() {
            return Err(Error::ClaimMismatch(format!(
                "OtClient::add_audience: the OTVID for {} needs renewal",
                vid.audience
            )));
        }
        let aud = vid.audience.clone();
        let entry = self.inner.services.get(&aud).await;
        entry
            .set(ServiceState {
                aud,
                vid: Some(Arc::new(vid)),
                endpoint: endpoint.to_string(),
            })
            .await;
        Ok(())
    }

    /// Discover the subject domain's configuration now, unconditionally.
    pub async fn load_config(&self) -> Result<DomainConfig, Error> {
        let entry = self.inner.domains.get(&self.inner.td.otid()).await;
        entry.renew_now(|s| self.renew_domain(s)).await
    }

    /// Load the domain configuration and keep refreshing it in the
    /// background at the authority's hinted interval. Refresh failures are
    /// delivered to the [`OtClient::set_on_error`] callback and do not
    /// abort the loop; the loop exits when the last client handle drops.
    pub async fn refresh_config(&self) -> Result<(), Error> {
        self.load_config().await?;

        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            loop {
                let interval = match weak.upgrade() {
                    Some(inner) => *read_lock(&inner.refresh),
                    None => return,
                };
                tokio::time::sleep(interval).await;
                let Some(inner) = weak.upgrade() else { return };
                let client = OtClient { inner };
                if let Err(err) = client.load_config().await {
                    debug!(error = %err, "background config refresh failed");
                    let callback = read_lock(&client.inner.on_error).clone();
                    if let Some(callback) = callback {
                        callback(&err);
                    }
                }
            }
        });
        Ok(())
    }

    async fn resolve_domain(&self) -> Result<DomainConfig, Error> {
        let entry = self.inner.domains.get(&self.inner.td.otid()).await;
        entry.resolve(|s| self.renew_domain(s)).await
    }

    // The domain keyset and authority endpoint used for local parsing:
    // statically configured keys win over discovery.
    async fn domain_material(&self) -> Result<(Arc<KeySet>, String), Error> {
        let static_keys = read_lock(&self.inner.domain_keys).clone();
        if let Some(keys) = static_keys {
            let entry = self.inner.domains.get(&self.inner.td.otid()).await;
            let endpoint = entry.snapshot().await.endpoint;
            return Ok((keys, endpoint));
        }
        let cfg = self.resolve_domain().await?;
        let keys = cfg.keys.ok_or_else(|| {
            Error::Discovery("OtClient::parse_otvid: no domain keys discovered".to_string())
        })?;
        Ok((keys, cfg.endpoint))
    }

    async fn renew_domain(&self, state: DomainState) -> Result<DomainState, Error> {
        debug!(domain = %state.td, "renewing trust domain configuration");
        let doc: DiscoveryDocument = self.inner.http.get(&state.td.config_url()).await?;

        const OP: &str = "DomainResolver::resolve";
        let expect = state.td.otid();
        if doc.otid != expect {
            return Err(Error::Discovery(format!(
                "{OP}: invalid domain config with {}, need {}",
                doc.otid, expect
            )));
        }

        let mut keys = Vec::with_capacity(doc.keys.len());
        for raw in doc.keys {
            let Value::Object(map) = raw else {
                return Err(Error::Discovery(format!(
                    "{OP}: invalid domain key: not a JSON object"
                )));
            };
            let key = Key::from_map(map)
                .map_err(|e| Error::Discovery(format!("{OP}: invalid domain key: {e}")))?;
            keys.push(key);
        }
        let keyset = KeySet::new(keys)
            .map_err(|e| Error::Discovery(format!("{OP}: invalid domain keys: {e}")))?;

        let endpoint = if state.endpoint.is_empty()
            || !doc.service_endpoints.contains(&state.endpoint)
        {
            select_endpoints(&self.inner.http, &doc.service_endpoints).await?
        } else {
            state.endpoint
        };

        let hint = if doc.keys_refresh_hint > 1 {
            let hint = Duration::from_secs(doc.keys_refresh_hint as u64);
            *write_lock(&self.inner.refresh) = hint;
            hint
        } else {
            DEFAULT_REFRESH
        };

        Ok(DomainState {
            td: state.td,
            keys: Some(Arc::new(keyset)),
            endpoint,
            expires_at: Some(SystemTime::now() + hint.max(MIN_CONFIG_TTL)),
        })
    }

    async fn renew_service(&self, state: ServiceState) -> Result<ServiceState, Error> {
        debug!(audience = %state.aud, "renewing audience OTVID");
        let output = self
            .sign(SignInput {
                subject: self.inner.sub.clone(),
                audience: state.aud.clone(),
                ..SignInput::default()
            })
            .await?;
        let vid = Otvid::parse_insecure(&output.otvid)?;

        let endpoint = if state.endpoint.is_empty()
            || !output.service_endpoints.contains(&state.endpoint)
        {
            select_endpoints(&self.inner.http, &output.service_endpoints).await?
        } else {
            state.endpoint
        };

        Ok(ServiceState {
            aud: state.aud,
            vid: Some(Arc::new(vid)),
            endpoint,
        })
    }
}

/// Resolves one trust domain's keys and authority endpoint through the
/// client's renewal cache.
pub struct DomainResolver {
    client: OtClient,
    entry: Arc<Entry<DomainState>>,
}

impl DomainResolver {
    /// The domain configuration, discovered or renewed as needed.
    pub async fn resolve(&self) -> Result<DomainConfig, Error> {
        self.entry.resolve(|s| self.client.renew_domain(s)).await
    }
}

/// Issues authenticated calls to one audience, renewing the subject's
/// OTVID and the audience endpoint as needed.
#[derive(Clone)]
pub struct ServiceClient {
    client: OtClient,
    audience: Otid,
    entry: Arc<Entry<ServiceState>>,
}

impl ServiceClient {
    /// The audience this client targets.
    pub fn audience(&self) -> &Otid {
        &self.audience
    }

    /// The audience configuration, renewed as needed. At most one renewal
    /// is in flight per audience at any instant.
    pub async fn resolve(&self) -> Result<ServiceConfig, Error> {
        self.entry.resolve(|s| self.client.renew_service(s)).await
    }

    /// Issue a request to `<service endpoint><path>` with the subject's
    /// OTVID injected as `Authorization: Bearer <token>`.
    pub async fn request<I, O>(
        &self,
        method: Method,
        path: &str,
        headers: Option<HeaderMap>,
        input: Option<&I>,
    ) -> Result<O, Error>
    where
        I: Serialize + ?Sized,
        O: DeserializeOwned,
    {
        let cfg = self.resolve().await?;
        let token = cfg.otvid.as_deref().map(Otvid::token).unwrap_or_default();
        let mut h = headers.unwrap_or_default();
        add_token_to_headers(&mut h, token);
        self.client
            .inner
            .http
            .request(method, &format!("{}{path}", cfg.endpoint), Some(h), input)
            .await
    }
}

fn read_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}
