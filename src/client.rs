//! Blocking HTTP client for the Emporia cloud API (the read-only subset we need).
//!
//! Authentication
//! - Exchanges the account's Cognito refresh token for an id token
//!   (`REFRESH_TOKEN_AUTH`) and sends it in the `authtoken` header.
//! - The id token is refreshed 30 s before it expires, and once more when a
//!   request comes back with HTTP 401.

use chrono::{DateTime, SecondsFormat, Utc};
use http::StatusCode;
use log::debug;
use serde::de::DeserializeOwned;
use std::cell::RefCell;
use std::time::{Duration, Instant};

use crate::models::emporia::{
    ChannelRef, ChartUsage, ChartUsageResponse, CustomerDevices, DeviceGid, DeviceInfo, DeviceListUsagesResponse,
    DeviceUsage, LocationProperties,
};
use crate::models::usage::{Granularity, TimeWindow};

const BASE_URL: &str = "https://api.emporiaenergy.com";
const COGNITO_URL: &str = "https://cognito-idp.us-east-2.amazonaws.com/";
const COGNITO_CLIENT_ID: &str = "4qte47jbstod8apnfic0bunmrq";
const ENERGY_UNIT: &str = "KilowattHours";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(30);

#[derive(Debug)]
pub enum ClientError {
    Transport(String),
    Http { status: u16, message: String },
    Json(String),
    Auth(String),
}

impl core::fmt::Display for ClientError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            ClientError::Transport(s) => write!(f, "transport error: {}", s),
            ClientError::Http { status, message } => write!(f, "http {}: {}", status, message),
            ClientError::Json(e) => write!(f, "json error: {}", e),
            ClientError::Auth(e) => write!(f, "auth error: {}", e),
        }
    }
}

impl std::error::Error for ClientError {}

impl From<ureq::Error> for ClientError {
    fn from(value: ureq::Error) -> Self {
        ClientError::Transport(value.to_string())
    }
}

/// Read access to an account's devices and their usage.
pub trait UsageSource {
    /// Usage tree of every listed device for the period of one `granularity`
    /// unit ending at `instant`.
    fn list_usage(
        &self,
        gids: &[DeviceGid],
        instant: DateTime<Utc>,
        granularity: Granularity,
    ) -> Result<Vec<DeviceUsage>, ClientError>;

    /// kWh samples for one channel across `window`, one per granularity unit.
    fn chart_usage(
        &self,
        channel: &ChannelRef,
        window: TimeWindow,
        granularity: Granularity,
    ) -> Result<ChartUsage, ClientError>;

    /// All devices on the account with nested devices flattened into the list.
    fn list_devices(&self) -> Result<Vec<DeviceInfo>, ClientError>;

    /// Fill in the device's location properties (including its display name).
    fn populate_device_properties(&self, device: DeviceInfo) -> Result<DeviceInfo, ClientError>;
}

#[derive(Debug, Clone)]
struct IdToken {
    id_token: String,
    expires_at: Instant,
}

#[derive(Debug)]
struct AuthState {
    token: Option<IdToken>,
    refresh_token: String,
}

pub struct EmporiaClient {
    agent: ureq::Agent,
    auth: RefCell<AuthState>,
}

impl EmporiaClient {
    pub fn new(refresh_token: impl Into<String>) -> Result<Self, ClientError> {
        let config = ureq::Agent::config_builder()
            .http_status_as_error(false)
            .timeout_global(Some(REQUEST_TIMEOUT))
            .build();
        let agent = ureq::Agent::new_with_config(config);

        let mut state = AuthState {
            token: None,
            refresh_token: refresh_token.into(),
        };
        if state.refresh_token.trim().is_empty() {
            return Err(ClientError::Auth("refresh token is empty".to_string()));
        }

        // Fail fast on a bad token rather than on the first usage request.
        state.token = Some(Self::cognito_refresh(&agent, &state.refresh_token)?);

        Ok(EmporiaClient {
            agent,
            auth: RefCell::new(state),
        })
    }

    fn url(path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{}", BASE_URL, path)
        } else {
            format!("{}/{}", BASE_URL, path)
        }
    }

    fn cognito_refresh(agent: &ureq::Agent, refresh_token: &str) -> Result<IdToken, ClientError> {
        #[derive(serde::Deserialize)]
        #[serde(rename_all = "PascalCase")]
        struct AuthenticationResult {
            id_token: String,
            expires_in: u64,
        }
        #[derive(serde::Deserialize)]
        #[serde(rename_all = "PascalCase")]
        struct InitiateAuthResponse {
            authentication_result: AuthenticationResult,
        }

        let payload = serde_json::json!({
            "AuthFlow": "REFRESH_TOKEN_AUTH",
            "ClientId": COGNITO_CLIENT_ID,
            "AuthParameters": { "REFRESH_TOKEN": refresh_token },
        })
        .to_string();

        let mut res = agent
            .post(COGNITO_URL)
            .header("Content-Type", "application/x-amz-json-1.1")
            .header("X-Amz-Target", "AWSCognitoIdentityProviderService.InitiateAuth")
            .send(payload.as_bytes())?;
        let status = res.status();
        let body = res.body_mut().read_to_string()?;
        if !status.is_success() {
            return Err(ClientError::Auth(format!("http {}: {}", status.as_u16(), body)));
        }
        let parsed: InitiateAuthResponse = decode(&body)?;
        debug!(
            "Obtained id token valid for {}s",
            parsed.authentication_result.expires_in
        );
        Ok(IdToken {
            id_token: parsed.authentication_result.id_token,
            expires_at: Instant::now() + Duration::from_secs(parsed.authentication_result.expires_in),
        })
    }

    fn id_token(&self, force_refresh: bool) -> Result<String, ClientError> {
        let mut s = self.auth.borrow_mut();
        let current = match &s.token {
            Some(t) if !force_refresh && Instant::now() + TOKEN_REFRESH_MARGIN < t.expires_at => Some(t.id_token.clone()),
            _ => None,
        };
        match current {
            Some(token) => Ok(token),
            None => {
                let fresh = Self::cognito_refresh(&self.agent, &s.refresh_token)?;
                let token = fresh.id_token.clone();
                s.token = Some(fresh);
                Ok(token)
            }
        }
    }

    fn send_get(&self, url: &str, query: &[(&str, String)], token: &str) -> Result<(StatusCode, String), ClientError> {
        let mut req = self
            .agent
            .get(url)
            .header("Accept", "application/json")
            .header("authtoken", token);
        for (k, v) in query {
            req = req.query(*k, v);
        }
        let mut res = req.call()?;
        let status = res.status();
        let body = res.body_mut().read_to_string()?;
        Ok((status, body))
    }

    fn get_json<T: DeserializeOwned>(&self, path: &str, query: &[(&str, String)]) -> Result<T, ClientError> {
        let url = Self::url(path);

        let token = self.id_token(false)?;
        let (mut status, mut body) = self.send_get(&url, query, &token)?;

        // Retry once with a freshly issued token.
        if status == StatusCode::UNAUTHORIZED {
            let token = self.id_token(true)?;
            (status, body) = self.send_get(&url, query, &token)?;
        }

        if !status.is_success() {
            return Err(ClientError::Http {
                status: status.as_u16(),
                message: body,
            });
        }
        decode(&body)
    }
}

fn decode<T: DeserializeOwned>(body: &str) -> Result<T, ClientError> {
    let de = &mut serde_json::Deserializer::from_str(body);
    serde_path_to_error::deserialize(de).map_err(|e| ClientError::Json(format!("{} at {}", e.inner(), e.path())))
}

fn format_instant(instant: DateTime<Utc>) -> String {
    instant.to_rfc3339_opts(SecondsFormat::Secs, true)
}

impl UsageSource for EmporiaClient {
    fn list_usage(
        &self,
        gids: &[DeviceGid],
        instant: DateTime<Utc>,
        granularity: Granularity,
    ) -> Result<Vec<DeviceUsage>, ClientError> {
        if gids.is_empty() {
            return Ok(Vec::new());
        }
        // The API expects a literal '+' between gids, which query encoding would escape.
        let joined = gids.iter().map(|g| g.to_string()).collect::<Vec<_>>().join("+");
        let path = format!("/AppAPI?apiMethod=getDeviceListUsages&deviceGids={}", joined);
        let res: DeviceListUsagesResponse = self.get_json(
            &path,
            &[
                ("instant", format_instant(instant)),
                ("scale", granularity.api_scale().to_string()),
                ("energyUnit", ENERGY_UNIT.to_string()),
            ],
        )?;
        Ok(res.device_list_usages.devices)
    }

    fn chart_usage(
        &self,
        channel: &ChannelRef,
        window: TimeWindow,
        granularity: Granularity,
    ) -> Result<ChartUsage, ClientError> {
        let res: ChartUsageResponse = self.get_json(
            "/AppAPI",
            &[
                ("apiMethod", "getChartUsage".to_string()),
                ("deviceGid", channel.device_gid.to_string()),
                ("channel", channel.channel_num.clone()),
                ("start", format_instant(window.start)),
                ("end", format_instant(window.end)),
                ("scale", granularity.api_scale().to_string()),
                ("energyUnit", ENERGY_UNIT.to_string()),
            ],
        )?;
        Ok(ChartUsage {
            batch_start: res.first_usage_instant.unwrap_or(window.start),
            samples: res.usage_list,
        })
    }

    fn list_devices(&self) -> Result<Vec<DeviceInfo>, ClientError> {
        let res: CustomerDevices = self.get_json("/customers/devices", &[])?;
        Ok(res.devices.into_iter().flat_map(DeviceInfo::flatten).collect())
    }

    fn populate_device_properties(&self, mut device: DeviceInfo) -> Result<DeviceInfo, ClientError> {
        let props: LocationProperties =
            self.get_json(&format!("/devices/{}/locationProperties", device.device_gid), &[])?;
        device.location_properties = Some(props);
        Ok(device)
    }
}
