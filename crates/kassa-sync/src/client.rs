//! # OFD Client
//!
//! Transport to the fiscal data operator (OFD).
//!
//! ## Transports
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        OfdClient Trait                                  │
//! │                                                                         │
//! │            submit(receipt) ──► Result<OfdAck, OfdError>                 │
//! │                 │                                                       │
//! │      ┌──────────┴──────────┐                                            │
//! │      ▼                     ▼                                            │
//! │  ┌────────────────┐   ┌────────────────────────────────────┐            │
//! │  │ MockOfdClient  │   │ HttpOfdClient                      │            │
//! │  │                │   │                                    │            │
//! │  │ Scriptable     │   │ POST {base}/api/v1/documents       │            │
//! │  │ responses,     │   │ timeout per request, JSON body     │            │
//! │  │ call recording │   │ keyed by receipt id (idempotent)   │            │
//! │  └────────────────┘   └────────────────────────────────────┘            │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Submission is idempotent on the operator side, keyed by receipt id:
//! a retry after an ambiguous timeout returns the original registration.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tracing::debug;

use kassa_core::{FiscalDocument, Receipt};

use crate::error::OfdError;

// =============================================================================
// Trait
// =============================================================================

/// Acknowledgment from the operator for one registered receipt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OfdAck {
    /// Operator-assigned fiscal document number.
    pub document_number: String,

    /// Operator wall clock at registration, epoch seconds.
    ///
    /// Fed into the hybrid clock so subsequent local receipts order
    /// after everything the operator has seen.
    pub server_time: i64,
}

/// Transport to the fiscal data operator.
#[async_trait]
pub trait OfdClient: Send + Sync {
    /// Submits one receipt for registration.
    async fn submit(&self, receipt: &Receipt) -> Result<OfdAck, OfdError>;
}

// =============================================================================
// Mock Transport
// =============================================================================

/// One scripted response for the mock transport.
#[derive(Debug, Clone)]
pub enum MockResponse {
    /// Successful registration.
    Ack {
        document_number: String,
        server_time: i64,
    },
    /// Connection-level failure.
    Unreachable,
    /// Request timeout (ambiguous outcome).
    Timeout,
    /// Operator 5xx.
    ServerError(u16),
    /// Operator 4xx: permanent rejection of this document.
    Rejected(u16, String),
}

#[derive(Debug, Default)]
struct MockState {
    script: VecDeque<MockResponse>,
    submitted: Vec<String>,
}

/// Scriptable in-process OFD transport.
///
/// Responses are consumed from a FIFO script; with an empty script every
/// submission succeeds with a generated document number. Every call is
/// recorded so tests can assert on exactly what reached the "operator".
#[derive(Debug, Default)]
pub struct MockOfdClient {
    state: Mutex<MockState>,
    doc_counter: AtomicU64,
    /// Artificial per-call latency (simulates network round trip).
    latency: Option<Duration>,
}

impl MockOfdClient {
    /// Creates a mock that acknowledges everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a mock with artificial per-call latency.
    pub fn with_latency(latency: Duration) -> Self {
        MockOfdClient {
            latency: Some(latency),
            ..Default::default()
        }
    }

    /// Queues a scripted response (FIFO).
    pub fn script(&self, response: MockResponse) {
        self.state.lock().expect("mock lock poisoned").script.push_back(response);
    }

    /// Queues the same failure `n` times.
    pub fn script_failures(&self, n: usize) {
        let mut state = self.state.lock().expect("mock lock poisoned");
        for _ in 0..n {
            state.script.push_back(MockResponse::Unreachable);
        }
    }

    /// Receipt ids submitted so far, in call order.
    pub fn submitted(&self) -> Vec<String> {
        self.state.lock().expect("mock lock poisoned").submitted.clone()
    }

    /// Number of calls that reached the mock.
    pub fn call_count(&self) -> usize {
        self.state.lock().expect("mock lock poisoned").submitted.len()
    }
}

#[async_trait]
impl OfdClient for MockOfdClient {
    async fn submit(&self, receipt: &Receipt) -> Result<OfdAck, OfdError> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        let scripted = {
            let mut state = self.state.lock().expect("mock lock poisoned");
            state.submitted.push(receipt.id.clone());
            state.script.pop_front()
        };

        match scripted {
            None => {
                let n = self.doc_counter.fetch_add(1, Ordering::SeqCst) + 1;
                Ok(OfdAck {
                    document_number: format!("mock-fd-{n:06}"),
                    server_time: chrono::Utc::now().timestamp(),
                })
            }
            Some(MockResponse::Ack {
                document_number,
                server_time,
            }) => Ok(OfdAck {
                document_number,
                server_time,
            }),
            Some(MockResponse::Unreachable) => {
                Err(OfdError::Unreachable("connection refused".into()))
            }
            Some(MockResponse::Timeout) => Err(OfdError::Timeout(10)),
            Some(MockResponse::ServerError(status)) => Err(OfdError::ServerError {
                status,
                message: "scripted server error".into(),
            }),
            Some(MockResponse::Rejected(status, message)) => {
                Err(OfdError::Rejected { status, message })
            }
        }
    }
}

// =============================================================================
// HTTP Transport
// =============================================================================

/// Wire request for document registration.
#[derive(Debug, Serialize)]
struct SubmitRequest<'a> {
    receipt_id: &'a str,
    pos_id: &'a str,
    document: &'a FiscalDocument,
}

/// Wire response from the operator.
#[derive(Debug, Deserialize)]
struct SubmitResponse {
    document_number: String,
    server_time: i64,
}

/// Real HTTP transport against the operator's registration endpoint.
#[derive(Debug, Clone)]
pub struct HttpOfdClient {
    http: reqwest::Client,
    base_url: String,
    timeout_secs: u64,
}

impl HttpOfdClient {
    /// Creates an HTTP transport with a per-request timeout.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, OfdError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| OfdError::Unreachable(e.to_string()))?;

        Ok(HttpOfdClient {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            timeout_secs: timeout.as_secs(),
        })
    }
}

#[async_trait]
impl OfdClient for HttpOfdClient {
    async fn submit(&self, receipt: &Receipt) -> Result<OfdAck, OfdError> {
        let url = format!("{}/api/v1/documents", self.base_url);

        debug!(receipt_id = %receipt.id, url = %url, "Submitting receipt to OFD");

        let response = self
            .http
            .post(&url)
            .json(&SubmitRequest {
                receipt_id: &receipt.id,
                pos_id: &receipt.pos_id,
                document: &receipt.fiscal_document,
            })
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    OfdError::Timeout(self.timeout_secs)
                } else {
                    OfdError::Unreachable(e.to_string())
                }
            })?;

        let status = response.status();

        if status.is_success() {
            let body: SubmitResponse = response
                .json()
                .await
                .map_err(|e| OfdError::MalformedResponse(e.to_string()))?;

            return Ok(OfdAck {
                document_number: body.document_number,
                server_time: body.server_time,
            });
        }

        let message = response.text().await.unwrap_or_default();

        // 429 is throttling, not a verdict on the document
        if status.is_server_error() || status.as_u16() == 429 {
            Err(OfdError::ServerError {
                status: status.as_u16(),
                message,
            })
        } else {
            Err(OfdError::Rejected {
                status: status.as_u16(),
                message,
            })
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use kassa_core::{HybridClock, PaymentKind, PaymentLine, ReceiptItem, ReceiptStatus, ReceiptType};

    fn sample_receipt(id: &str) -> Receipt {
        let clock = HybridClock::new();
        let document = FiscalDocument::from_lines(
            ReceiptType::Sale,
            vec![ReceiptItem {
                name: "Cleaning cloth".into(),
                unit_price_cents: 500,
                quantity: 1,
                line_total_cents: 500,
                tax_rate_bps: None,
            }],
            vec![PaymentLine {
                kind: PaymentKind::Cash,
                amount_cents: 500,
            }],
        );

        Receipt {
            id: id.into(),
            pos_id: "pos-01".into(),
            receipt_type: ReceiptType::Sale,
            idempotency_key: format!("key-{id}"),
            original_receipt_id: None,
            status: ReceiptStatus::Pending,
            order_key: clock.generate(),
            fiscal_document: document,
            retry_count: 0,
            last_error: None,
            next_attempt_at: None,
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
            synced_at: None,
        }
    }

    #[tokio::test]
    async fn test_mock_defaults_to_ack() {
        let client = MockOfdClient::new();

        let ack = client.submit(&sample_receipt("r1")).await.unwrap();
        assert!(ack.document_number.starts_with("mock-fd-"));
        assert_eq!(client.submitted(), vec!["r1".to_string()]);
    }

    #[tokio::test]
    async fn test_mock_script_is_fifo() {
        let client = MockOfdClient::new();
        client.script(MockResponse::Unreachable);
        client.script(MockResponse::Ack {
            document_number: "fd-1".into(),
            server_time: 1_700_000_000,
        });

        let first = client.submit(&sample_receipt("r1")).await;
        assert!(matches!(first, Err(OfdError::Unreachable(_))));

        let second = client.submit(&sample_receipt("r2")).await.unwrap();
        assert_eq!(second.document_number, "fd-1");
        assert_eq!(second.server_time, 1_700_000_000);

        assert_eq!(client.call_count(), 2);
    }

    #[tokio::test]
    async fn test_mock_rejection_is_not_retryable() {
        let client = MockOfdClient::new();
        client.script(MockResponse::Rejected(422, "unknown tax code".into()));

        let err = client.submit(&sample_receipt("r1")).await.unwrap_err();
        assert!(!err.is_retryable());
    }
}
