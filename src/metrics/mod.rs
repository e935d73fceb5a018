//! The metrics-sink seam: tagged sample writes and last-value queries.
//!
//! Values are persisted to an InfluxDB-compatible time-series store over
//! HTTP line protocol; asynchronous pipelines read them back through the
//! `last()` InfluxQL query. Both v1 (`/write?u=&p=&db=`) and v2
//! (`/api/v2/write?org=&bucket=` with a token) endpoints are supported; the
//! v1 query endpoint is used against both server generations.

use std::time::Duration;

use reqwest::Client;
use thiserror::Error;
use tracing::error;

use crate::config::InfluxDoc;
use crate::sample::Value;

#[derive(Error, Debug)]
pub enum MetricsError {
    #[error("HTTP request failed: {0}")]
    RequestFailed(#[from] reqwest::Error),

    #[error("metrics store returned status {status}: {body}")]
    ServerError { status: u16, body: String },

    #[error("could not parse metrics response: {0}")]
    ParseError(String),

    #[error("invalid metrics configuration: {0}")]
    BadConfig(String),
}

fn precision_multiplier(precision: &str) -> Result<i64, MetricsError> {
    Ok(match precision {
        "s" => 1,
        "ms" => 1_000,
        "us" => 1_000_000,
        "ns" => 1_000_000_000,
        other => {
            return Err(MetricsError::BadConfig(format!(
                "unknown precision '{}'",
                other
            )))
        }
    })
}

/// Writes tagged samples to the time-series store.
pub struct MetricsSink {
    client: Client,
    write_url: String,
    token: Option<String>,
    precision: i64,
    experiment: String,
}

impl MetricsSink {
    pub fn from_config(cfg: &InfluxDoc, experiment: &str) -> Result<Self, MetricsError> {
        let precision = precision_multiplier(&cfg.precision)?;
        let mut params = vec![("precision".to_string(), cfg.precision.clone())];
        let (path, token) = match cfg.version {
            1 => {
                params.push((
                    "u".to_string(),
                    cfg.username.clone().unwrap_or_default(),
                ));
                params.push((
                    "p".to_string(),
                    cfg.password.clone().unwrap_or_default(),
                ));
                params.push(("db".to_string(), cfg.org.clone().unwrap_or_default()));
                ("/write?", None)
            }
            2 => {
                params.push(("org".to_string(), cfg.org.clone().unwrap_or_default()));
                params.push((
                    "bucket".to_string(),
                    cfg.bucket.clone().unwrap_or_default(),
                ));
                ("/api/v2/write?", cfg.token.clone())
            }
            other => {
                return Err(MetricsError::BadConfig(format!(
                    "version must be 1 or 2, not {}",
                    other
                )))
            }
        };
        let query: Vec<String> = params.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        let write_url = format!("{}{}{}", cfg.url, path, query.join("&"));
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(MetricsError::RequestFailed)?;
        Ok(Self {
            client,
            write_url,
            token,
            precision,
            experiment: experiment.to_string(),
        })
    }

    /// Write one record: `topic[,tag=val…] field=val[,…] <timestamp>`.
    /// Integer fields get the line-protocol `i` suffix.
    pub async fn write(
        &self,
        topic: &str,
        tags: &[(&str, &str)],
        fields: &[(&str, Value)],
        timestamp: f64,
    ) -> Result<(), MetricsError> {
        if fields.is_empty() {
            return Err(MetricsError::BadConfig(
                "at least one field is required".to_string(),
            ));
        }
        // everything from the test experiment lands in one measurement
        let mut line = if self.experiment == "testing" {
            "testing".to_string()
        } else {
            topic.to_string()
        };
        for (key, value) in tags {
            line.push_str(&format!(",{}={}", key, value));
        }
        line.push(' ');
        let rendered: Vec<String> = fields
            .iter()
            .map(|(key, value)| match value {
                Value::Int(i) => format!("{}={}i", key, i),
                other => format!("{}={}", key, other),
            })
            .collect();
        line.push_str(&rendered.join(","));
        line.push_str(&format!(" {}", (timestamp * self.precision as f64) as i64));

        let mut request = self.client.post(&self.write_url).body(line);
        if let Some(token) = &self.token {
            request = request.header("Authorization", format!("Token {}", token));
        }
        let response = request.send().await?;
        let status = response.status();
        if status.as_u16() != 200 && status.as_u16() != 204 {
            let body = response.text().await.unwrap_or_default();
            error!("Metrics write got status {} instead of 200/204", status);
            return Err(MetricsError::ServerError {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }
}

/// A prepared `SELECT last(...)` query for one sensor's topic.
///
/// v1 stores keep one field per sensor, so the field is the sensor name;
/// v2-schema stores keep a `value` field with a `sensor` tag.
#[derive(Debug, Clone)]
pub struct LastValueQuery {
    url: String,
    params: Vec<(String, String)>,
    token: Option<String>,
}

impl LastValueQuery {
    pub fn new(cfg: &InfluxDoc, topic: &str, sensor: &str) -> Result<Self, MetricsError> {
        let (variable, selection) = if cfg.version == 1 {
            (sensor.to_string(), String::new())
        } else {
            // the quoting in the WHERE clause matters: double quotes make
            // the server treat the name as an identifier and return nothing
            ("value".to_string(), format!(" WHERE sensor='{}'", sensor))
        };
        let query = format!("SELECT last({}) FROM {}{};", variable, topic, selection);
        let mut params = vec![("q".to_string(), query)];
        let token = match cfg.version {
            1 => {
                params.push((
                    "u".to_string(),
                    cfg.username.clone().unwrap_or_default(),
                ));
                params.push((
                    "p".to_string(),
                    cfg.password.clone().unwrap_or_default(),
                ));
                params.push((
                    "db".to_string(),
                    cfg.database.clone().unwrap_or_default(),
                ));
                None
            }
            2 => {
                // the v1 query endpoint also serves v2 data through the
                // database mapping
                params.push(("db".to_string(), cfg.db.clone().unwrap_or_default()));
                params.push(("org".to_string(), cfg.org.clone().unwrap_or_default()));
                cfg.token.clone()
            }
            other => {
                return Err(MetricsError::BadConfig(format!(
                    "version must be 1 or 2, not {}",
                    other
                )))
            }
        };
        Ok(Self {
            url: format!("{}/query", cfg.url),
            params,
            token,
        })
    }

    /// Fetch the latest `(timestamp_ns, value)` pair.
    pub async fn fetch(&self, client: &Client) -> Result<(i64, f64), MetricsError> {
        let mut request = client
            .get(&self.url)
            .query(&self.params)
            .header("Accept", "application/csv");
        if let Some(token) = &self.token {
            request = request.header("Authorization", format!("Token {}", token));
        }
        let response = request.send().await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(MetricsError::ServerError {
                status: status.as_u16(),
                body,
            });
        }
        parse_last_value_csv(&body)
    }
}

/// Pull `(timestamp, value)` out of the CSV the query endpoint returns:
/// a header row, then one row whose last two columns are what we want.
fn parse_last_value_csv(body: &str) -> Result<(i64, f64), MetricsError> {
    let row = body
        .lines()
        .nth(1)
        .ok_or_else(|| MetricsError::ParseError(format!("no data row in: {:?}", body)))?;
    let columns: Vec<&str> = row.split(',').collect();
    if columns.len() < 2 {
        return Err(MetricsError::ParseError(format!("short row: {:?}", row)));
    }
    let timestamp = columns[columns.len() - 2]
        .trim()
        .parse::<i64>()
        .map_err(|e| MetricsError::ParseError(format!("bad timestamp: {}", e)))?;
    let value = columns[columns.len() - 1]
        .trim()
        .parse::<f64>()
        .map_err(|e| MetricsError::ParseError(format!("bad value: {}", e)))?;
    Ok((timestamp, value))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v2_config() -> InfluxDoc {
        serde_yaml::from_str(
            r#"
url: http://localhost:8086
version: 2
precision: ms
org: pancake
bucket: slowdata
db: slowdata
token: sekrit
"#,
        )
        .unwrap()
    }

    #[test]
    fn test_write_url_v2() {
        let sink = MetricsSink::from_config(&v2_config(), "pancake").unwrap();
        assert!(sink.write_url.starts_with("http://localhost:8086/api/v2/write?"));
        assert!(sink.write_url.contains("org=pancake"));
        assert!(sink.write_url.contains("bucket=slowdata"));
        assert_eq!(sink.token.as_deref(), Some("sekrit"));
        assert_eq!(sink.precision, 1_000);
    }

    #[test]
    fn test_write_url_v1() {
        let cfg: InfluxDoc = serde_yaml::from_str(
            r#"
url: http://localhost:8086
version: 1
precision: s
org: pancake
username: u
password: p
database: slowdata
"#,
        )
        .unwrap();
        let sink = MetricsSink::from_config(&cfg, "pancake").unwrap();
        assert!(sink.write_url.starts_with("http://localhost:8086/write?"));
        assert!(sink.write_url.contains("u=u"));
        assert!(sink.write_url.contains("db=pancake"));
        assert!(sink.token.is_none());
    }

    #[test]
    fn test_bad_version_rejected() {
        let mut cfg = v2_config();
        cfg.version = 3;
        assert!(MetricsSink::from_config(&cfg, "x").is_err());
        assert!(LastValueQuery::new(&cfg, "t", "s").is_err());
    }

    #[test]
    fn test_query_shape_v2() {
        let query = LastValueQuery::new(&v2_config(), "pressure", "pressure_inner").unwrap();
        let q = &query.params[0].1;
        assert_eq!(
            q,
            "SELECT last(value) FROM pressure WHERE sensor='pressure_inner';"
        );
    }

    #[test]
    fn test_query_shape_v1() {
        let mut cfg = v2_config();
        cfg.version = 1;
        let query = LastValueQuery::new(&cfg, "pressure", "pressure_inner").unwrap();
        assert_eq!(query.params[0].1, "SELECT last(pressure_inner) FROM pressure;");
    }

    #[test]
    fn test_parse_csv() {
        let body = "name,tags,time,last\npressure,,1719922441000000000,3.75\n";
        assert_eq!(
            parse_last_value_csv(body).unwrap(),
            (1719922441000000000, 3.75)
        );
    }

    #[test]
    fn test_parse_csv_no_rows() {
        assert!(parse_last_value_csv("name,tags,time,last\n").is_err());
        assert!(parse_last_value_csv("").is_err());
    }
}
