//! Data query request/response envelope

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Reference from a query to the datasource instance it targets
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataSourceRef {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub ds_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
}

/// One query; fields other than `refId` and `datasource` are opaque to the
/// aggregator and forwarded as-is.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataQuery {
    #[serde(default)]
    pub ref_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub datasource: Option<DataSourceRef>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryDataRequest {
    #[serde(default)]
    pub queries: Vec<DataQuery>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
}

/// Backend answer keyed by query `refId`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryDataResponse {
    #[serde(default)]
    pub results: BTreeMap<String, Value>,
}

impl QueryDataRequest {
    /// The datasource reference of the first query that carries one
    pub fn datasource_ref(&self) -> Option<&DataSourceRef> {
        self.queries.iter().find_map(|q| q.datasource.as_ref())
    }
}
