use std::time::Duration;

use bridge_client::domain::{ConsumptionNode, ConsumptionPage, Cursor};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::json;
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

use crate::pipeline::{BridgeError, HistoryApi};

pub const DEFAULT_QUERY_URL: &str = "https://api.tibber.com/v1-beta/gql";

const CONSUMPTION_QUERY: &str = r#"
query Consumption($homeId: ID!, $first: Int!, $after: String) {
  viewer {
    home(id: $homeId) {
      consumption(resolution: HOURLY, first: $first, after: $after) {
        pageInfo {
          hasNextPage
          endCursor
        }
        nodes {
          from
          to
          consumption
          cost
          currency
          unitPrice
          unitPriceVAT
          totalCost
          unitCost
          consumptionUnit
        }
      }
    }
  }
}
"#;

#[derive(Deserialize)]
struct GraphQlResponse {
    data: Option<ViewerData>,
    #[serde(default)]
    errors: Vec<GraphQlError>,
}

#[derive(Deserialize)]
struct GraphQlError {
    message: String,
}

#[derive(Deserialize)]
struct ViewerData {
    viewer: Viewer,
}

#[derive(Deserialize)]
struct Viewer {
    home: Option<Home>,
}

#[derive(Deserialize)]
struct Home {
    consumption: Option<IncomingConsumption>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct IncomingConsumption {
    page_info: PageInfo,
    #[serde(default)]
    nodes: Vec<IncomingNode>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PageInfo {
    has_next_page: bool,
    end_cursor: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct IncomingNode {
    from: String,
    to: Option<String>,
    consumption: Option<f64>,
    cost: Option<f64>,
    currency: Option<String>,
    unit_price: Option<f64>,
    #[serde(rename = "unitPriceVAT")]
    unit_price_vat: Option<f64>,
    total_cost: Option<f64>,
    unit_cost: Option<f64>,
    consumption_unit: Option<String>,
}

impl TryFrom<IncomingNode> for ConsumptionNode {
    type Error = time::error::Parse;

    fn try_from(i: IncomingNode) -> Result<Self, Self::Error> {
        Ok(ConsumptionNode {
            from: OffsetDateTime::parse(&i.from, &Rfc3339)?,
            to: i.to.as_deref().and_then(|s| OffsetDateTime::parse(s, &Rfc3339).ok()),
            consumption: i.consumption,
            cost: i.cost,
            currency: i.currency,
            unit_price: i.unit_price,
            unit_price_vat: i.unit_price_vat,
            total_cost: i.total_cost,
            unit_cost: i.unit_cost,
            consumption_unit: i.consumption_unit,
        })
    }
}

impl From<IncomingConsumption> for ConsumptionPage {
    fn from(c: IncomingConsumption) -> Self {
        let nodes = c
            .nodes
            .into_iter()
            .filter_map(|n| {
                let from = n.from.clone();
                match ConsumptionNode::try_from(n) {
                    Ok(node) => Some(node),
                    Err(e) => {
                        tracing::warn!(error = %e, from = %from, "dropping consumption node with bad timestamp");
                        None
                    }
                }
            })
            .collect();

        ConsumptionPage {
            nodes,
            has_next_page: c.page_info.has_next_page,
            end_cursor: c.page_info.end_cursor.map(Cursor::new),
        }
    }
}

/// Tibber GraphQL client for hourly consumption history.
#[derive(Clone)]
pub struct TibberHistoryClient {
    client: Client,
    query_url: String,
    access_token: String,
}

impl TibberHistoryClient {
    pub fn new(
        query_url: impl Into<String>,
        access_token: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, BridgeError> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| BridgeError::Config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            query_url: query_url.into(),
            access_token: access_token.into(),
        })
    }
}

#[async_trait::async_trait]
impl HistoryApi for TibberHistoryClient {
    async fn consumption_page(
        &self,
        home_id: &str,
        first: u32,
        after: &Cursor,
    ) -> Result<ConsumptionPage, BridgeError> {
        let body = json!({
            "query": CONSUMPTION_QUERY,
            "variables": {
                "homeId": home_id,
                "first": first,
                "after": after.as_str(),
            },
        });

        let response = self
            .client
            .post(&self.query_url)
            .bearer_auth(&self.access_token)
            .json(&body)
            .send()
            .await
            .map_err(|e| BridgeError::Api(format!("request failed: {e}")))?;

        match response.status() {
            StatusCode::OK => {}
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                return Err(BridgeError::Api("authentication failed".to_string()));
            }
            status => {
                let text = response.text().await.unwrap_or_default();
                return Err(BridgeError::Api(format!("status {status}: {text}")));
            }
        }

        let parsed: GraphQlResponse = response
            .json()
            .await
            .map_err(|e| BridgeError::Api(format!("invalid response body: {e}")))?;

        if !parsed.errors.is_empty() {
            let messages: Vec<_> = parsed.errors.into_iter().map(|e| e.message).collect();
            return Err(BridgeError::Api(messages.join("; ")));
        }

        let consumption = parsed
            .data
            .and_then(|d| d.viewer.home)
            .ok_or_else(|| BridgeError::Api(format!("home {home_id} not found")))?
            .consumption
            .ok_or_else(|| BridgeError::Api("response has no consumption".to_string()))?;

        let page = ConsumptionPage::from(consumption);
        tracing::debug!(
            nodes = page.nodes.len(),
            has_next_page = page.has_next_page,
            "fetched consumption page"
        );
        Ok(page)
    }
}
