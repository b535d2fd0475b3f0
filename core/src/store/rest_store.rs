/// Hosted relational store over a PostgREST-style HTTP API
///
/// Tables:
///   conversations    id, user_code, client_user_id
///   messages         id, conversation_id, role, content, attachment_url, created_at
///   outbound_queue   id, target_user_id, message_type, content, priority,
///                    scheduled_for, delivery_window, status, context, created_at
///
/// Every call is bounded by the configured request timeout. Connection
/// failures, timeouts, 408, 429 and 5xx are transient.
use super::{MessageStore, OutboundQueue, PageRequest};
use crate::error::{Result, SyncError};
use crate::types::{
    Conversation, ConversationId, DeliveryStatus, Message, MessageId, NewMessage,
    NewOutboundEntry, OutboundQueueEntry, QueueEntryId,
};
use async_trait::async_trait;
use bytes::Bytes;
use http::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use http_body_util::{BodyExt, Full};
use hyper::{Method, Request, StatusCode};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::{debug, warn};

pub struct RestStore {
    client: Client<HttpConnector, Full<Bytes>>,
    base_url: String,
    api_key: String,
    timeout: Duration,
}

impl RestStore {
    pub fn new(base_url: &str, api_key: &str, timeout: Duration) -> Result<Self> {
        if base_url.is_empty() {
            return Err(SyncError::Config("REST store URL is empty".to_string()));
        }
        let client = Client::builder(TokioExecutor::new()).build_http();
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            timeout,
        })
    }

    async fn call(&self, method: Method, path: &str, body: Option<Vec<u8>>) -> Result<Bytes> {
        let uri = format!("{}/rest/v1/{}", self.base_url, path);
        let mut builder = Request::builder()
            .method(method.clone())
            .uri(&uri)
            .header("apikey", &self.api_key)
            .header(AUTHORIZATION, format!("Bearer {}", self.api_key))
            .header(ACCEPT, "application/json");
        if body.is_some() {
            builder = builder
                .header(CONTENT_TYPE, "application/json")
                .header("Prefer", "return=representation");
        }
        let req = builder
            .body(Full::new(Bytes::from(body.unwrap_or_default())))
            .map_err(|e| SyncError::Storage(format!("Invalid request {}: {}", uri, e)))?;

        debug!("{} {}", method, uri);
        let exchange = async {
            let resp = self
                .client
                .request(req)
                .await
                .map_err(|e| SyncError::TransientFetch(format!("{} {}: {}", method, uri, e)))?;
            let status = resp.status();
            let body = resp
                .into_body()
                .collect()
                .await
                .map_err(|e| SyncError::TransientFetch(format!("body read error: {}", e)))?
                .to_bytes();
            Ok::<_, SyncError>((status, body))
        };

        let (status, body) = tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| SyncError::TransientFetch(format!("{} {} timed out", method, uri)))??;

        check_status(status, &body)?;
        Ok(body)
    }

    async fn get_rows<T: DeserializeOwned>(&self, path: &str) -> Result<Vec<T>> {
        let body = self.call(Method::GET, path, None).await?;
        Ok(serde_json::from_slice(&body)?)
    }

    async fn write_one<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        value: &serde_json::Value,
    ) -> Result<Option<T>> {
        let body = self
            .call(method, path, Some(serde_json::to_vec(value)?))
            .await?;
        let mut rows: Vec<T> = serde_json::from_slice(&body)?;
        Ok(if rows.is_empty() {
            None
        } else {
            Some(rows.swap_remove(0))
        })
    }
}

fn check_status(status: StatusCode, body: &[u8]) -> Result<()> {
    if status.is_success() {
        return Ok(());
    }
    let detail = String::from_utf8_lossy(body);
    if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
    {
        warn!("Store unavailable ({}): {}", status, detail);
        Err(SyncError::TransientFetch(format!("store returned {}", status)))
    } else {
        Err(SyncError::Storage(format!("store returned {}: {}", status, detail)))
    }
}

fn page_query(conversation: ConversationId, page: PageRequest) -> String {
    let mut q = format!(
        "messages?select=*&conversation_id=eq.{}&order=id.desc&limit={}",
        conversation, page.limit
    );
    if let Some(before) = page.before {
        q.push_str(&format!("&id=lt.{}", before));
    }
    q
}

fn after_query(conversation: ConversationId, after: MessageId, limit: usize) -> String {
    format!(
        "messages?select=*&conversation_id=eq.{}&id=gt.{}&order=id.asc&limit={}",
        conversation, after, limit
    )
}

#[async_trait]
impl MessageStore for RestStore {
    async fn conversation_by_user_code(&self, user_code: &str) -> Result<Conversation> {
        let path = format!(
            "conversations?select=*&user_code=eq.{}&limit=1",
            urlencoding::encode(user_code)
        );
        let mut rows: Vec<Conversation> = self.get_rows(&path).await?;
        if rows.is_empty() {
            return Err(SyncError::NotFound(format!(
                "no conversation for user code {}",
                user_code
            )));
        }
        Ok(rows.swap_remove(0))
    }

    async fn list_by_conversation(
        &self,
        conversation: ConversationId,
        page: PageRequest,
    ) -> Result<Vec<Message>> {
        self.get_rows(&page_query(conversation, page)).await
    }

    async fn list_after(
        &self,
        conversation: ConversationId,
        after: MessageId,
        limit: usize,
    ) -> Result<Vec<Message>> {
        self.get_rows(&after_query(conversation, after, limit)).await
    }

    async fn create(&self, message: NewMessage) -> Result<Message> {
        let value = serde_json::to_value(&message)?;
        self.write_one(Method::POST, "messages", &value)
            .await?
            .ok_or_else(|| SyncError::Storage("insert returned no message row".to_string()))
    }
}

#[async_trait]
impl OutboundQueue for RestStore {
    async fn insert(&self, entry: NewOutboundEntry) -> Result<OutboundQueueEntry> {
        let mut value = serde_json::to_value(&entry)?;
        if let Some(obj) = value.as_object_mut() {
            obj.insert(
                "status".to_string(),
                serde_json::to_value(DeliveryStatus::Pending)?,
            );
        }
        self.write_one(Method::POST, "outbound_queue", &value)
            .await?
            .ok_or_else(|| SyncError::Storage("insert returned no queue row".to_string()))
    }

    async fn pending(&self, limit: usize) -> Result<Vec<OutboundQueueEntry>> {
        let path = format!(
            "outbound_queue?select=*&status=eq.pending&order=priority.asc,scheduled_for.asc,id.asc&limit={}",
            limit
        );
        self.get_rows(&path).await
    }

    async fn settle(&self, id: QueueEntryId, status: DeliveryStatus) -> Result<OutboundQueueEntry> {
        if !DeliveryStatus::Pending.can_transition_to(status) {
            return Err(SyncError::Validation(format!(
                "queue entry {} cannot be settled as {}",
                id, status
            )));
        }
        // Conditional on status=pending so a settled row is never touched again
        let path = format!("outbound_queue?id=eq.{}&status=eq.pending", id);
        let value = serde_json::json!({ "status": status });
        if let Some(entry) = self.write_one(Method::PATCH, &path, &value).await? {
            return Ok(entry);
        }

        let existing: Vec<OutboundQueueEntry> = self
            .get_rows(&format!("outbound_queue?select=*&id=eq.{}", id))
            .await?;
        match existing.first() {
            Some(e) => Err(SyncError::Validation(format!(
                "queue entry {} cannot move from {} to {}",
                id, e.status, status
            ))),
            None => Err(SyncError::NotFound(format!("queue entry {}", id))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_query_with_and_without_cursor() {
        let newest = page_query(ConversationId(7), PageRequest::newest(30));
        assert_eq!(
            newest,
            "messages?select=*&conversation_id=eq.7&order=id.desc&limit=30"
        );
        let older = page_query(ConversationId(7), PageRequest::older_than(MessageId(99), 30));
        assert!(older.ends_with("&id=lt.99"));
    }

    #[test]
    fn test_after_query_orders_ascending() {
        let q = after_query(ConversationId(3), MessageId(10), 5);
        assert!(q.contains("id=gt.10"));
        assert!(q.contains("order=id.asc"));
    }

    #[test]
    fn test_status_classification() {
        assert!(check_status(StatusCode::OK, b"[]").is_ok());
        assert!(matches!(
            check_status(StatusCode::SERVICE_UNAVAILABLE, b""),
            Err(SyncError::TransientFetch(_))
        ));
        assert!(matches!(
            check_status(StatusCode::TOO_MANY_REQUESTS, b""),
            Err(SyncError::TransientFetch(_))
        ));
        assert!(matches!(
            check_status(StatusCode::BAD_REQUEST, b"{\"message\":\"bad column\"}"),
            Err(SyncError::Storage(_))
        ));
    }

    #[tokio::test]
    async fn test_unreachable_store_is_transient() {
        // Nothing listens on port 9 locally
        let store = RestStore::new("http://127.0.0.1:9", "key", Duration::from_millis(500)).unwrap();
        let err = store.conversation_by_user_code("c1").await.unwrap_err();
        assert!(err.is_recoverable());
    }
}
