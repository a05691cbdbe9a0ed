//! Header value filter.

use async_trait::async_trait;
use http::HeaderName;
use regex::RegexSet;
use serde::Deserialize;

use super::{parse_params, Filter, FilterError};
use crate::entity::Entity;

#[derive(Debug, Deserialize)]
struct HeaderParams {
    header: String,
    patterns: Vec<String>,
}

/// Filters entities where any value of `header` matches a pattern.
///
/// A missing header passes. Transports without headers make `apply` fail,
/// which the chain treats as indeterminate.
#[derive(Debug, Clone)]
pub struct HeaderFilter {
    header: HeaderName,
    set: RegexSet,
}

impl HeaderFilter {
    pub fn new(header: HeaderName, set: RegexSet) -> Self {
        Self { header, set }
    }

    pub fn from_params(name: &str, params: &serde_yaml::Value) -> Result<Self, FilterError> {
        let params: HeaderParams = parse_params(name, params)?;
        let invalid = |reason: String| FilterError::Params {
            filter: name.to_string(),
            reason,
        };

        let header = HeaderName::from_bytes(params.header.as_bytes())
            .map_err(|e| invalid(e.to_string()))?;
        let set = RegexSet::new(&params.patterns).map_err(|e| invalid(e.to_string()))?;

        Ok(Self::new(header, set))
    }
}

#[async_trait]
impl Filter for HeaderFilter {
    async fn apply(&self, entity: &dyn Entity) -> Result<bool, FilterError> {
        let headers = entity.headers()?;

        Ok(headers
            .get_all(&self.header)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .any(|value| self.set.is_match(value)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{EntityError, HttpRequest, TcpConnection};
    use bytes::Bytes;
    use http_body_util::Full;

    fn filter() -> HeaderFilter {
        let params: serde_yaml::Value =
            serde_yaml::from_str("header: User-Agent\npatterns: [\"(?i)^(curl|wget)/\", \"zgrab\"]")
                .unwrap();
        HeaderFilter::from_params("ua", &params).unwrap()
    }

    fn request(agent: Option<&str>) -> HttpRequest<Full<Bytes>> {
        let mut builder = http::Request::builder().uri("/");
        if let Some(agent) = agent {
            builder = builder.header("user-agent", agent);
        }
        HttpRequest::new("198.51.100.20:5000", builder.body(Full::new(Bytes::new())).unwrap())
            .unwrap()
    }

    #[tokio::test]
    async fn test_header_match() {
        let f = filter();
        assert!(f.apply(&request(Some("curl/8.4.0"))).await.unwrap());
        assert!(f.apply(&request(Some("Mozilla/5.0 zgrab/0.x"))).await.unwrap());
        assert!(!f.apply(&request(Some("Mozilla/5.0"))).await.unwrap());
    }

    #[tokio::test]
    async fn test_missing_header_passes() {
        assert!(!filter().apply(&request(None)).await.unwrap());
    }

    #[tokio::test]
    async fn test_unsupported_transport() {
        let conn = TcpConnection::new("198.51.100.20:5000".parse().unwrap(), Bytes::new());
        let err = filter().apply(&conn).await.unwrap_err();
        assert!(matches!(
            err,
            FilterError::Entity(EntityError::Unsupported("headers"))
        ));
    }
}
