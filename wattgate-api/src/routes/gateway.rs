//! The gateway endpoint.
//!
//! `GET|POST /api/gateway?action=...` dispatches on `action`, taken from the
//! query string or the JSON body (query wins). Session actions pass through
//! the [`SessionGate`] before anything else happens.

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::HeaderMap,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Deserializer};
use serde_json::{json, Value};
use std::fmt;
use std::str::FromStr;
use wattgate_core::{
    parse_query_date, AccessError, Aggregation, GatewayError, GatewayResult, LookupScope,
};

use crate::error::{ApiError, ApiResult};
use crate::gateway::ConsumptionParams;
use crate::session::SessionGate;
use crate::state::AppState;
use crate::telemetry::metrics;

// ============================================================================
// ACTIONS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    TestConfig,
    TestAuth,
    GetToken,
    GetMeteringPoints,
    GetConsumption,
    ThirdpartyAuthorizations,
    ThirdpartyConsumption,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::TestConfig => "test-config",
            Action::TestAuth => "test-auth",
            Action::GetToken => "get-token",
            Action::GetMeteringPoints => "get-metering-points",
            Action::GetConsumption => "get-consumption",
            Action::ThirdpartyAuthorizations => "thirdparty-authorizations",
            Action::ThirdpartyConsumption => "thirdparty-consumption",
        }
    }

    /// Unauthenticated pass-through actions.
    pub fn is_direct(&self) -> bool {
        !matches!(
            self,
            Action::ThirdpartyAuthorizations | Action::ThirdpartyConsumption
        )
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = ApiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "test-config" => Ok(Action::TestConfig),
            "test-auth" => Ok(Action::TestAuth),
            "get-token" => Ok(Action::GetToken),
            "get-metering-points" => Ok(Action::GetMeteringPoints),
            "get-consumption" => Ok(Action::GetConsumption),
            "thirdparty-authorizations" => Ok(Action::ThirdpartyAuthorizations),
            "thirdparty-consumption" => Ok(Action::ThirdpartyConsumption),
            other => Err(ApiError::unknown_action(Some(other))),
        }
    }
}

// ============================================================================
// REQUEST TYPES
// ============================================================================

/// Query string parameters. Metering point ids are comma separated.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayQuery {
    pub action: Option<String>,
    pub customer_id: Option<String>,
    pub identifier: Option<String>,
    pub scope: Option<String>,
    pub metering_point_ids: Option<String>,
    pub date_from: Option<String>,
    pub date_to: Option<String>,
    pub aggregation: Option<String>,
}

/// JSON body parameters.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayRequest {
    pub action: Option<String>,
    #[serde(default, deserialize_with = "string_or_number")]
    pub customer_id: Option<String>,
    #[serde(default, deserialize_with = "string_or_number")]
    pub identifier: Option<String>,
    pub scope: Option<String>,
    #[serde(default)]
    pub metering_point_ids: Vec<String>,
    pub date_from: Option<String>,
    pub date_to: Option<String>,
    pub aggregation: Option<String>,
}

/// Identifiers such as CVR numbers may arrive as JSON numbers.
fn string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::String(s)) => Some(s),
        Some(Value::Number(n)) => Some(n.to_string()),
        Some(Value::Null) | None => None,
        Some(other) => {
            return Err(serde::de::Error::custom(format!(
                "expected a string or number, got {}",
                other
            )))
        }
    })
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

impl GatewayRequest {
    /// Combine body and query. The query decides the action; body fields win
    /// for everything else.
    pub fn merged(body: GatewayRequest, query: GatewayQuery) -> Self {
        let query_ids: Vec<String> = query
            .metering_point_ids
            .map(|csv| csv.split(',').map(|id| id.trim().to_string()).collect())
            .unwrap_or_default();
        let mut ids: Vec<String> = if body.metering_point_ids.is_empty() {
            query_ids
        } else {
            body.metering_point_ids
        };
        ids.retain(|id| !id.trim().is_empty());

        Self {
            action: non_blank(query.action).or(non_blank(body.action)),
            customer_id: non_blank(body.customer_id).or(non_blank(query.customer_id)),
            identifier: non_blank(body.identifier).or(non_blank(query.identifier)),
            scope: non_blank(body.scope).or(non_blank(query.scope)),
            metering_point_ids: ids.into_iter().map(|id| id.trim().to_string()).collect(),
            date_from: non_blank(body.date_from).or(non_blank(query.date_from)),
            date_to: non_blank(body.date_to).or(non_blank(query.date_to)),
            aggregation: non_blank(body.aggregation).or(non_blank(query.aggregation)),
        }
    }

    fn action(&self) -> ApiResult<Action> {
        match self.action.as_deref() {
            Some(action) => action.parse(),
            None => Err(ApiError::unknown_action(None)),
        }
    }

    fn scope(&self) -> GatewayResult<Option<LookupScope>> {
        self.scope.as_deref().map(LookupScope::from_str).transpose()
    }

    fn consumption_params(&self) -> GatewayResult<ConsumptionParams> {
        let date_from = self
            .date_from
            .as_deref()
            .ok_or_else(|| GatewayError::missing("dateFrom"))?;
        let date_to = self
            .date_to
            .as_deref()
            .ok_or_else(|| GatewayError::missing("dateTo"))?;
        let aggregation = match self.aggregation.as_deref() {
            Some(raw) => raw.parse()?,
            None => Aggregation::default(),
        };
        Ok(ConsumptionParams {
            date_from: parse_query_date("dateFrom", date_from)?,
            date_to: parse_query_date("dateTo", date_to)?,
            aggregation,
            metering_point_ids: self.metering_point_ids.clone(),
        })
    }
}

// ============================================================================
// HANDLER
// ============================================================================

/// GET|POST /api/gateway
pub async fn gateway_handler(
    State(state): State<AppState>,
    Query(query): Query<GatewayQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let body = match parse_body(&body) {
        Ok(body) => body,
        Err(e) => return e.into_response(),
    };
    let request = GatewayRequest::merged(body, query);

    let action = match request.action() {
        Ok(action) => action,
        Err(e) => {
            record_action("unknown", e.status_code().as_u16());
            return e.into_response();
        }
    };

    let result = dispatch(&state, action, &request, &headers).await;
    let response = match result {
        Ok(payload) => Json(payload).into_response(),
        Err(e) => {
            tracing::debug!(action = %action, error = %e, "gateway action failed");
            ApiError::from(e).into_response()
        }
    };
    record_action(action.as_str(), response.status().as_u16());
    response
}

fn parse_body(body: &Bytes) -> ApiResult<GatewayRequest> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(GatewayRequest::default());
    }
    Ok(serde_json::from_slice(body)?)
}

fn record_action(action: &str, status: u16) {
    if let Some(m) = metrics() {
        m.record_action(action, status);
    }
}

async fn dispatch(
    state: &AppState,
    action: Action,
    request: &GatewayRequest,
    headers: &HeaderMap,
) -> GatewayResult<Value> {
    if action.is_direct() && !state.config.direct_actions_enabled {
        return Err(AccessError::ActionDisabled {
            action: action.as_str().to_string(),
        }
        .into());
    }

    match action {
        Action::TestConfig => Ok(test_config(state)),
        Action::TestAuth => state.gateway.test_auth().await,
        Action::GetToken => state.gateway.token().await,
        Action::GetMeteringPoints => {
            let identifier = request
                .identifier
                .as_deref()
                .ok_or_else(|| GatewayError::missing("identifier"))?;
            let scope = request
                .scope()?
                .unwrap_or_else(|| LookupScope::for_identity(identifier));
            let ids = state.gateway.metering_points(scope, identifier).await?;
            Ok(json!({
                "identifier": identifier,
                "scope": scope,
                "meteringPointIds": ids,
            }))
        }
        Action::GetConsumption => {
            let scope = request.scope()?;
            let params = request.consumption_params()?;
            state
                .gateway
                .direct_consumption(request.identifier.as_deref(), scope, params)
                .await
        }
        Action::ThirdpartyAuthorizations => {
            let customer = authorize(&state.sessions, request, headers).await?;
            state.gateway.list_authorizations(&customer).await
        }
        Action::ThirdpartyConsumption => {
            let customer = authorize(&state.sessions, request, headers).await?;
            let params = request.consumption_params()?;
            state.gateway.consumption(&customer, params).await
        }
    }
}

/// The session gate. Either `customerId` or `identifier` names the requested
/// customer; both must match the binding when present.
async fn authorize(
    sessions: &SessionGate,
    request: &GatewayRequest,
    headers: &HeaderMap,
) -> GatewayResult<String> {
    let customer = sessions
        .authorize(headers, request.customer_id.as_deref())
        .await?;
    if let Some(identifier) = request.identifier.as_deref() {
        if identifier != customer {
            tracing::warn!("identifier does not match session binding");
            return Err(AccessError::CustomerMismatch.into());
        }
    }
    Ok(customer)
}

fn test_config(state: &AppState) -> Value {
    let config = &state.config;
    json!({
        "ok": true,
        "environment": config.environment,
        "upstreamBaseUrl": config.upstream_base_url,
        "sessionConfigured": state.sessions.is_configured(),
        "sessionCookie": state.sessions.cookie_name(),
        "store": state.store.backend_name(),
        "directActionsEnabled": config.direct_actions_enabled,
        "uptimeSecs": state.uptime().as_secs(),
        "gateway": state.gateway.config_report(),
    })
}

// ============================================================================
// ROUTER
// ============================================================================

pub fn create_router() -> Router<AppState> {
    Router::new().route("/api/gateway", get(gateway_handler).post(gateway_handler))
}
