use super::{BulkResponse, IndexStore, ProjectedHit, ScanStream};
use async_trait::async_trait;
use docsync_core::config::StoreConfig;
use docsync_core::{Error, Result};
use futures::stream::{self, StreamExt, TryStreamExt};
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;

const SCROLL_KEEPALIVE: &str = "5m";

/// Elasticsearch-backed index store speaking the REST API over reqwest.
pub struct ElasticStore {
    client: Client,
    url: String,
    username: String,
    password: String,
    scan_page_size: usize,
}

impl ElasticStore {
    pub fn new(config: &StoreConfig) -> Result<Self> {
        debug!(url = %config.url, "Connecting to index store");

        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;

        Ok(Self {
            client,
            url: config.url.trim_end_matches('/').to_string(),
            username: config.username.clone(),
            password: config.password.clone(),
            scan_page_size: config.scan_page_size,
        })
    }

    fn auth(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        request.basic_auth(&self.username, Some(&self.password))
    }
}

#[async_trait]
impl IndexStore for ElasticStore {
    async fn bulk(&self, entries: Vec<Value>) -> Result<BulkResponse> {
        let body = ndjson_body(&entries)?;

        let response = self
            .auth(self.client.post(format!("{}/_bulk", self.url)))
            .header(reqwest::header::CONTENT_TYPE, "application/x-ndjson")
            .body(body)
            .send()
            .await?;
        let response = expect_success(response, "bulk write").await?;

        Ok(response.json::<BulkResponse>().await?)
    }

    async fn scan_ids(&self, index: &str) -> Result<ScanStream> {
        debug!(index, "Scanning existing index");

        let response = self
            .auth(self.client.get(format!("{}/{}", self.url, index)))
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(Error::NotFound {
                index: index.to_string(),
            });
        }
        expect_success(response, "index lookup").await?;

        let scroller = Scroller {
            client: self.client.clone(),
            url: self.url.clone(),
            username: self.username.clone(),
            password: self.password.clone(),
            index: index.to_string(),
            page_size: self.scan_page_size,
            scroll_id: None,
        };

        let pages = stream::try_unfold(scroller, |mut scroller| async move {
            let hits = scroller.next_page().await?;
            if hits.is_empty() {
                Ok::<_, Error>(None)
            } else {
                Ok(Some((hits, scroller)))
            }
        });

        Ok(pages
            .map_ok(|hits| stream::iter(hits.into_iter().map(Ok)))
            .try_flatten()
            .boxed())
    }

    async fn prepare_index(
        &self,
        index: &str,
        seed_docs: Option<&[Value]>,
        delete_first: bool,
    ) -> Result<()> {
        debug!(index, "Checking index");
        let response = self
            .auth(self.client.head(format!("{}/{}", self.url, index)))
            .query(&[("expand_wildcards", "hidden")])
            .send()
            .await?;

        if response.status().is_success() {
            debug!(index, "Index exists");
            if !delete_first {
                return Ok(());
            }
            debug!(index, "Deleting it first");
            let response = self
                .auth(self.client.delete(format!("{}/{}", self.url, index)))
                .query(&[("expand_wildcards", "hidden")])
                .send()
                .await?;
            expect_success(response, "index delete").await?;
        }

        debug!(index, "Creating index");
        let response = self
            .auth(self.client.put(format!("{}/{}", self.url, index)))
            .send()
            .await?;
        expect_success(response, "index create").await?;

        let Some(docs) = seed_docs else {
            return Ok(());
        };
        for (position, doc) in docs.iter().enumerate() {
            let response = self
                .auth(
                    self.client
                        .put(format!("{}/{}/_doc/{}", self.url, index, position + 1)),
                )
                .json(doc)
                .send()
                .await?;
            expect_success(response, "seed document").await?;
        }

        Ok(())
    }

    async fn delete_index(&self, index: &str) -> Result<()> {
        debug!(index, "Deleting index");
        let response = self
            .auth(self.client.delete(format!("{}/{}", self.url, index)))
            .query(&[("expand_wildcards", "hidden")])
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(Error::NotFound {
                index: index.to_string(),
            });
        }
        expect_success(response, "index delete").await?;
        Ok(())
    }
}

/// Cursor over a scroll-based scan; each page transfers only the projected
/// `id` and `timestamp` fields.
struct Scroller {
    client: Client,
    url: String,
    username: String,
    password: String,
    index: String,
    page_size: usize,
    scroll_id: Option<String>,
}

impl Scroller {
    async fn next_page(&mut self) -> Result<Vec<ProjectedHit>> {
        let request = match &self.scroll_id {
            None => self
                .client
                .post(format!("{}/{}/_search", self.url, self.index))
                .query(&[("scroll", SCROLL_KEEPALIVE)])
                .json(&json!({
                    "size": self.page_size,
                    "_source": ["id", "timestamp"],
                    "query": {"match_all": {}},
                })),
            Some(scroll_id) => self
                .client
                .post(format!("{}/_search/scroll", self.url))
                .json(&json!({"scroll": SCROLL_KEEPALIVE, "scroll_id": scroll_id})),
        };

        let response = request
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await?;
        let response = expect_success(response, "scan").await?;
        let page: SearchPage = response.json().await?;

        if page.scroll_id.is_some() {
            self.scroll_id = page.scroll_id;
        }

        if page.hits.hits.is_empty() {
            self.clear().await;
            return Ok(Vec::new());
        }

        Ok(page.hits.hits.into_iter().map(ProjectedHit::from).collect())
    }

    async fn clear(&mut self) {
        let Some(scroll_id) = self.scroll_id.take() else {
            return;
        };
        let result = self
            .client
            .delete(format!("{}/_search/scroll", self.url))
            .basic_auth(&self.username, Some(&self.password))
            .json(&json!({"scroll_id": scroll_id}))
            .send()
            .await;
        if let Err(e) = result {
            debug!(error = %e, "Failed to clear scroll context");
        }
    }
}

#[derive(Debug, Deserialize)]
struct SearchPage {
    #[serde(rename = "_scroll_id")]
    scroll_id: Option<String>,
    hits: SearchHits,
}

#[derive(Debug, Deserialize)]
struct SearchHits {
    hits: Vec<SearchHit>,
}

#[derive(Debug, Deserialize)]
struct SearchHit {
    #[serde(rename = "_id")]
    id: String,
    #[serde(rename = "_source", default)]
    source: Option<Value>,
}

impl From<SearchHit> for ProjectedHit {
    fn from(hit: SearchHit) -> Self {
        let source = hit.source.unwrap_or(Value::Null);
        let id = source
            .get("id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or(hit.id);
        let timestamp = source
            .get("timestamp")
            .and_then(Value::as_str)
            .map(str::to_string);
        Self { id, timestamp }
    }
}

fn ndjson_body(entries: &[Value]) -> Result<String> {
    let mut body = String::new();
    for entry in entries {
        body.push_str(&serde_json::to_string(entry)?);
        body.push('\n');
    }
    Ok(body)
}

async fn expect_success(response: Response, operation: &str) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(Error::Store(format!(
        "{operation} returned {status}: {body}"
    )))
}
