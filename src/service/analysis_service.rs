//! Image analysis: a text answer about one image.
//!
//! Analysis is not metered. It needs an authenticated caller but never
//! touches the ledger.

use std::sync::Arc;

use uuid::Uuid;

use crate::domain::{AnalysisRequest, Identity};
use crate::error::GatewayError;
use crate::upstream::{ImageAnalysis, ImageAnalyzer};

/// Forwards validated analysis requests upstream.
#[derive(Debug, Clone)]
pub struct AnalysisService {
    analyzer: Arc<dyn ImageAnalyzer>,
    model: String,
}

impl AnalysisService {
    /// Creates an analysis service answering with `model`.
    #[must_use]
    pub fn new(analyzer: Arc<dyn ImageAnalyzer>, model: impl Into<String>) -> Self {
        Self {
            analyzer,
            model: model.into(),
        }
    }

    /// Describes the image at `image_url`, answering `prompt` or the
    /// default question.
    ///
    /// # Errors
    ///
    /// [`GatewayError::InvalidRequest`] for a missing or malformed image
    /// URL, or [`GatewayError::Upstream`] when the model call fails.
    pub async fn analyze(
        &self,
        identity: &Identity,
        image_url: Option<String>,
        prompt: Option<String>,
    ) -> Result<ImageAnalysis, GatewayError> {
        let request = AnalysisRequest::new(
            identity.account_id.clone(),
            image_url,
            prompt,
            self.model.clone(),
        )?;
        let request_id = Uuid::new_v4();
        tracing::info!(
            %request_id,
            account_id = %request.account_id,
            model = %request.model,
            prompt_chars = request.prompt.chars().count(),
            "calling upstream analyzer"
        );

        self.analyzer.analyze(&request).await.map_err(|failure| {
            tracing::warn!(
                %request_id,
                account_id = %request.account_id,
                kind = %failure.kind,
                status = ?failure.status,
                "upstream analysis failed"
            );
            GatewayError::Upstream(failure)
        })
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::domain::AccountId;
    use crate::domain::generation::DEFAULT_ANALYSIS_PROMPT;
    use crate::upstream::{UpstreamErrorKind, UpstreamFailure};

    #[derive(Debug, Default)]
    struct EchoAnalyzer {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl ImageAnalyzer for EchoAnalyzer {
        async fn analyze(
            &self,
            request: &AnalysisRequest,
        ) -> Result<ImageAnalysis, UpstreamFailure> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(UpstreamFailure::new(
                    UpstreamErrorKind::Unavailable,
                    Some(503),
                    "down",
                ));
            }
            Ok(ImageAnalysis {
                analysis: format!("asked: {}", request.prompt),
                model: request.model.clone(),
            })
        }
    }

    fn who() -> Identity {
        Identity::new(AccountId::new("u1"), None)
    }

    #[tokio::test]
    async fn uses_default_question_and_model() {
        let analyzer = Arc::new(EchoAnalyzer::default());
        let svc = AnalysisService::new(Arc::<EchoAnalyzer>::clone(&analyzer), "vision-model");
        let Ok(answer) = svc
            .analyze(&who(), Some("https://cdn.example/a.png".to_string()), None)
            .await
        else {
            panic!("analysis");
        };
        assert_eq!(answer.analysis, format!("asked: {DEFAULT_ANALYSIS_PROMPT}"));
        assert_eq!(answer.model, "vision-model");
        assert_eq!(analyzer.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn missing_image_never_reaches_upstream() {
        let analyzer = Arc::new(EchoAnalyzer::default());
        let svc = AnalysisService::new(Arc::<EchoAnalyzer>::clone(&analyzer), "vision-model");
        assert!(matches!(
            svc.analyze(&who(), None, Some("what?".to_string())).await,
            Err(GatewayError::InvalidRequest(_))
        ));
        assert_eq!(analyzer.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn upstream_failure_is_surfaced() {
        let analyzer = Arc::new(EchoAnalyzer {
            calls: AtomicUsize::new(0),
            fail: true,
        });
        let svc = AnalysisService::new(analyzer, "vision-model");
        let Err(GatewayError::Upstream(failure)) = svc
            .analyze(&who(), Some("https://cdn.example/a.png".to_string()), None)
            .await
        else {
            panic!("expected upstream failure");
        };
        assert_eq!(failure.kind, UpstreamErrorKind::Unavailable);
    }
}
