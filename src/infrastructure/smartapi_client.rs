//! SmartAPI REST client.
//!
//! Every call is paced by a shared governor limiter, bounded by the reqwest
//! timeout, and unwrapped from the `{status, message, errorcode, data}` envelope
//! into either the payload or a classifiable `EngineError`.

use crate::domain::entities::exchange::Instrument;
use crate::domain::entities::order::{OrderAck, OrderRequest, OrderStatus, OrderType, Variety};
use crate::domain::errors::{EngineError, EngineResult};
use crate::domain::repositories::broker_client::{
    BrokerClient, Candle, CandleInterval, FeedCredentials,
};
use crate::rate_limit::GlobalRateLimiter;
use crate::secrets::BrokerCredentials;
use async_trait::async_trait;
use chrono::NaiveDateTime;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info};
use zeroize::Zeroizing;

const PLACE_ORDER: &str = "/rest/secure/angelbroking/order/v1/placeOrder";
const MODIFY_ORDER: &str = "/rest/secure/angelbroking/order/v1/modifyOrder";
const CANCEL_ORDER: &str = "/rest/secure/angelbroking/order/v1/cancelOrder";
const ORDER_DETAILS: &str = "/rest/secure/angelbroking/order/v1/details";
const QUOTE: &str = "/rest/secure/angelbroking/market/v1/quote/";
const CANDLES: &str = "/rest/secure/angelbroking/historical/v1/getCandleData";
const GENERATE_TOKENS: &str = "/rest/auth/angelbroking/jwt/v1/generateTokens";

#[derive(Debug, Clone)]
pub struct SmartApiConfig {
    pub base_url: String,
    pub timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    status: bool,
    #[serde(default)]
    message: String,
    #[serde(default, alias = "errorCode")]
    errorcode: String,
    data: Option<T>,
}

#[derive(Debug, Deserialize)]
struct OrderData {
    orderid: String,
    #[serde(default)]
    uniqueorderid: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TokenData {
    jwt_token: String,
    refresh_token: String,
    feed_token: String,
}

#[derive(Debug, Deserialize)]
struct QuoteData {
    #[serde(default)]
    fetched: Vec<QuoteEntry>,
}

#[derive(Debug, Deserialize)]
struct QuoteEntry {
    ltp: f64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RefreshRequest<'a> {
    refresh_token: &'a str,
}

/// Tokens that change on refresh
struct Session {
    jwt_token: Zeroizing<String>,
    refresh_token: Zeroizing<String>,
    feed_token: Zeroizing<String>,
}

pub struct SmartApiClient {
    http: Client,
    config: SmartApiConfig,
    api_key: Zeroizing<String>,
    client_code: String,
    session: RwLock<Session>,
    limiter: GlobalRateLimiter,
}

impl SmartApiClient {
    pub fn new(
        config: SmartApiConfig,
        credentials: BrokerCredentials,
        limiter: GlobalRateLimiter,
    ) -> EngineResult<Self> {
        let http = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| EngineError::InvalidConfiguration(format!("HTTP client: {}", e)))?;

        Ok(Self {
            http,
            config,
            api_key: credentials.api_key,
            client_code: credentials.client_code,
            session: RwLock::new(Session {
                jwt_token: credentials.jwt_token,
                refresh_token: credentials.refresh_token,
                feed_token: credentials.feed_token,
            }),
            limiter,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    async fn headers(&self) -> EngineResult<HeaderMap> {
        let session = self.session.read().await;
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        headers.insert(header("x-usertype"), HeaderValue::from_static("USER"));
        headers.insert(header("x-sourceid"), HeaderValue::from_static("WEB"));
        headers.insert(header("x-clientlocalip"), HeaderValue::from_static("127.0.0.1"));
        headers.insert(header("x-clientpublicip"), HeaderValue::from_static("127.0.0.1"));
        headers.insert(header("x-macaddress"), HeaderValue::from_static("00:00:00:00:00:00"));
        headers.insert(header("x-privatekey"), secret_header(&self.api_key)?);
        headers.insert(
            AUTHORIZATION,
            secret_header(&format!("Bearer {}", session.jwt_token.as_str()))?,
        );
        Ok(headers)
    }

    async fn post<B, T>(&self, path: &str, body: &B) -> EngineResult<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        self.limiter.until_ready().await;
        debug!("POST {}", path);
        let response = self
            .http
            .post(self.url(path))
            .headers(self.headers().await?)
            .json(body)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;
        self.unwrap_envelope(response).await
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> EngineResult<T> {
        self.limiter.until_ready().await;
        debug!("GET {}", path);
        let response = self
            .http
            .get(self.url(path))
            .headers(self.headers().await?)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;
        self.unwrap_envelope(response).await
    }

    fn transport_error(&self, error: reqwest::Error) -> EngineError {
        if error.is_timeout() {
            EngineError::Timeout(self.config.timeout)
        } else {
            EngineError::Network(error.to_string())
        }
    }

    async fn unwrap_envelope<T: DeserializeOwned>(
        &self,
        response: reqwest::Response,
    ) -> EngineResult<T> {
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| self.transport_error(e))?;

        if let Some(error) = http_status_error(status, &text) {
            return Err(error);
        }

        let envelope: Envelope<T> = serde_json::from_str(&text)
            .map_err(|e| EngineError::MalformedResponse(format!("{}: {}", e, truncate(&text))))?;
        if !envelope.status {
            return Err(EngineError::from_broker(&envelope.errorcode, &envelope.message));
        }
        envelope
            .data
            .ok_or_else(|| EngineError::MalformedResponse("envelope without data".to_string()))
    }
}

#[async_trait]
impl BrokerClient for SmartApiClient {
    fn name(&self) -> &str {
        "smartapi"
    }

    async fn place_order(&self, order: &OrderRequest) -> EngineResult<OrderAck> {
        order
            .validate()
            .map_err(EngineError::InvalidSignal)?;
        let data: OrderData = self.post(PLACE_ORDER, &order_body(order)).await?;
        info!(
            "Order placed: {} {} x{} -> {}",
            order.side, order.instrument.trading_symbol, order.quantity, data.orderid
        );
        Ok(ack(data))
    }

    async fn modify_order(&self, order_id: &str, order: &OrderRequest) -> EngineResult<OrderAck> {
        order
            .validate()
            .map_err(EngineError::InvalidSignal)?;
        let mut body = order_body(order);
        body["orderid"] = json!(order_id);
        let data: OrderData = self.post(MODIFY_ORDER, &body).await?;
        info!("Order modified: {}", order_id);
        Ok(ack(data))
    }

    async fn cancel_order(&self, order_id: &str, variety: Variety) -> EngineResult<()> {
        let body = json!({ "variety": variety, "orderid": order_id });
        let _: Value = self.post(CANCEL_ORDER, &body).await?;
        info!("Order cancelled: {}", order_id);
        Ok(())
    }

    async fn order_status(&self, ack: &OrderAck) -> EngineResult<OrderStatus> {
        let id = if ack.unique_order_id.is_empty() {
            &ack.order_id
        } else {
            &ack.unique_order_id
        };
        let data: Value = self.get(&format!("{}/{}", ORDER_DETAILS, id)).await?;
        parse_order_status(&data)
    }

    async fn quote(&self, instrument: &Instrument) -> EngineResult<f64> {
        let mut exchange_tokens = serde_json::Map::new();
        exchange_tokens.insert(
            instrument.exchange.name().to_string(),
            json!([instrument.token]),
        );
        let body = json!({ "mode": "LTP", "exchangeTokens": exchange_tokens });
        let data: QuoteData = self.post(QUOTE, &body).await?;
        data.fetched
            .first()
            .map(|entry| entry.ltp)
            .ok_or_else(|| {
                EngineError::MissingData(format!("no quote for {}", instrument.trading_symbol))
            })
    }

    async fn candles(
        &self,
        instrument: &Instrument,
        interval: CandleInterval,
        from: NaiveDateTime,
        to: NaiveDateTime,
    ) -> EngineResult<Vec<Candle>> {
        let body = json!({
            "exchange": instrument.exchange.name(),
            "symboltoken": instrument.token,
            "interval": interval.as_str(),
            "fromdate": from.format("%Y-%m-%d %H:%M").to_string(),
            "todate": to.format("%Y-%m-%d %H:%M").to_string(),
        });
        let rows: Vec<(String, f64, f64, f64, f64, f64)> = self.post(CANDLES, &body).await?;
        Ok(rows
            .into_iter()
            .map(|(timestamp, open, high, low, close, volume)| Candle {
                timestamp,
                open,
                high,
                low,
                close,
                volume: volume.max(0.0) as u64,
            })
            .collect())
    }

    async fn refresh_session(&self) -> EngineResult<()> {
        let refresh_token = self.session.read().await.refresh_token.clone();
        if refresh_token.is_empty() {
            return Err(EngineError::InvalidSession(
                "no refresh token available".to_string(),
            ));
        }
        let data: TokenData = self
            .post(
                GENERATE_TOKENS,
                &RefreshRequest {
                    refresh_token: refresh_token.as_str(),
                },
            )
            .await?;

        let mut session = self.session.write().await;
        session.jwt_token = Zeroizing::new(data.jwt_token);
        session.refresh_token = Zeroizing::new(data.refresh_token);
        session.feed_token = Zeroizing::new(data.feed_token);
        info!("Broker session refreshed for {}", self.client_code);
        Ok(())
    }

    async fn feed_credentials(&self) -> EngineResult<FeedCredentials> {
        let session = self.session.read().await;
        Ok(FeedCredentials {
            jwt_token: session.jwt_token.clone(),
            feed_token: session.feed_token.clone(),
            api_key: self.api_key.clone(),
            client_code: self.client_code.clone(),
        })
    }
}

fn header(name: &'static str) -> HeaderName {
    HeaderName::from_static(name)
}

fn secret_header(value: &str) -> EngineResult<HeaderValue> {
    let mut header = HeaderValue::from_str(value)
        .map_err(|_| EngineError::InvalidConfiguration("credential is not a valid header".into()))?;
    header.set_sensitive(true);
    Ok(header)
}

fn ack(data: OrderData) -> OrderAck {
    OrderAck {
        unique_order_id: data.uniqueorderid,
        order_id: data.orderid,
    }
}

fn order_body(order: &OrderRequest) -> Value {
    let price = match (order.order_type, order.price) {
        (OrderType::Limit, Some(price)) => format!("{:.2}", price),
        _ => "0".to_string(),
    };
    let mut body = json!({
        "variety": order.variety,
        "tradingsymbol": order.instrument.trading_symbol,
        "symboltoken": order.instrument.token,
        "transactiontype": order.side,
        "exchange": order.instrument.exchange,
        "ordertype": order.order_type,
        "producttype": order.product,
        "duration": "DAY",
        "price": price,
        "quantity": order.quantity.to_string(),
        "squareoff": "0",
        "stoploss": "0",
    });
    if let Some(tag) = &order.tag {
        body["ordertag"] = json!(tag);
    }
    body
}

/// Map an HTTP-level failure before the envelope is looked at
fn http_status_error(status: StatusCode, body: &str) -> Option<EngineError> {
    if status.is_success() {
        return None;
    }
    let detail = format!("HTTP {}: {}", status.as_u16(), truncate(body));
    let error = match status {
        _ if body.to_lowercase().contains("access rate") => EngineError::RateLimited(detail),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => EngineError::InvalidSession(detail),
        StatusCode::TOO_MANY_REQUESTS => EngineError::RateLimited(detail),
        s if s.is_server_error() => EngineError::Network(detail),
        _ => EngineError::Broker {
            code: format!("HTTP{}", status.as_u16()),
            message: truncate(body),
        },
    };
    Some(error)
}

fn parse_order_status(data: &Value) -> EngineResult<OrderStatus> {
    let status = data
        .get("orderstatus")
        .or_else(|| data.get("status"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_lowercase();
    let filled_quantity = number(data.get("filledshares")).unwrap_or(0.0).max(0.0) as u32;
    // An execution without a price cannot be booked
    let average_price = || {
        number(data.get("averageprice"))
            .filter(|price| *price > 0.0)
            .ok_or_else(|| {
                EngineError::MalformedResponse(format!(
                    "{} order with {} filled has no averageprice",
                    status, filled_quantity
                ))
            })
    };

    let parsed = match status.as_str() {
        "complete" => OrderStatus::Complete {
            average_price: average_price()?,
            filled_quantity,
        },
        "rejected" => OrderStatus::Rejected {
            reason: data
                .get("text")
                .and_then(Value::as_str)
                .unwrap_or("rejected")
                .to_string(),
        },
        "cancelled" if filled_quantity > 0 => OrderStatus::Cancelled {
            average_price: average_price()?,
            filled_quantity,
        },
        "cancelled" => OrderStatus::Cancelled {
            filled_quantity: 0,
            average_price: 0.0,
        },
        "open" | "open pending" | "trigger pending" | "modified" | "modify pending" => {
            OrderStatus::Open
        }
        _ => OrderStatus::Pending,
    };
    Ok(parsed)
}

/// SmartAPI sends numbers both as JSON numbers and as strings
fn number(value: Option<&Value>) -> Option<f64> {
    match value? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn truncate(text: &str) -> String {
    text.chars().take(200).collect()
}
