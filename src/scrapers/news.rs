//! News-sentiment capability.
//!
//! The probability engine treats sentiment as one more evidence source; the
//! provider behind the trait may be a real news service or absent entirely.
//! The returned LLR is already in log-odds space.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Sentiment summary for one market question.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewsSentiment {
    /// Mean headline sentiment in [-1, 1].
    pub avg_sentiment: f64,
    pub headline_count: usize,
    /// Provider confidence in [0, 1].
    pub confidence: f64,
    /// Log-odds contribution.
    pub llr: f64,
    pub headlines: Vec<String>,
}

#[async_trait]
pub trait SentimentProvider: Send + Sync {
    /// `Ok(None)` when the provider has nothing for this question.
    async fn sentiment_for(&self, question: &str) -> Result<Option<NewsSentiment>>;
}

/// Provider used when no news key is configured.
pub struct NullSentimentProvider;

#[async_trait]
impl SentimentProvider for NullSentimentProvider {
    async fn sentiment_for(&self, _question: &str) -> Result<Option<NewsSentiment>> {
        Ok(None)
    }
}

#[derive(Debug, Deserialize)]
struct NewsResponse {
    #[serde(default)]
    articles: Vec<NewsArticle>,
}

#[derive(Debug, Deserialize)]
struct NewsArticle {
    #[serde(default)]
    title: Option<String>,
}

/// Headline-based sentiment scored with a small polarity lexicon.
pub struct NewsApiClient {
    http: Client,
    api_key: String,
}

const POSITIVE_WORDS: &[&str] = &[
    "wins", "surges", "leads", "beats", "confirmed", "approved", "record", "strong", "rally",
    "breakthrough", "succeeds", "advances",
];
const NEGATIVE_WORDS: &[&str] = &[
    "loses", "drops", "trails", "fails", "denied", "rejected", "weak", "crash", "scandal",
    "collapse", "recalls", "retreats",
];

impl NewsApiClient {
    pub fn new(api_key: String) -> Self {
        let http = Client::builder()
            .timeout(Duration::from_secs(10))
            .user_agent("edgebot/0.1")
            .build()
            .expect("reqwest client");
        Self { http, api_key }
    }

    fn score_headline(title: &str) -> f64 {
        let lower = title.to_lowercase();
        let positive = POSITIVE_WORDS.iter().filter(|w| lower.contains(*w)).count() as f64;
        let negative = NEGATIVE_WORDS.iter().filter(|w| lower.contains(*w)).count() as f64;
        if positive + negative == 0.0 {
            0.0
        } else {
            (positive - negative) / (positive + negative)
        }
    }
}

#[async_trait]
impl SentimentProvider for NewsApiClient {
    async fn sentiment_for(&self, question: &str) -> Result<Option<NewsSentiment>> {
        // The question text is a decent search query once boilerplate words
        // are stripped.
        let query: String = question
            .split_whitespace()
            .filter(|w| w.len() > 3 && !matches!(w.to_lowercase().as_str(), "will" | "does" | "before"))
            .take(6)
            .collect::<Vec<_>>()
            .join(" ");
        if query.is_empty() {
            return Ok(None);
        }

        let response: NewsResponse = self
            .http
            .get("https://newsapi.org/v2/everything")
            .query(&[
                ("q", query.as_str()),
                ("sortBy", "publishedAt"),
                ("pageSize", "20"),
                ("apiKey", self.api_key.as_str()),
            ])
            .send()
            .await
            .context("news request")?
            .error_for_status()
            .context("news status")?
            .json()
            .await
            .context("news json")?;

        let headlines: Vec<String> = response
            .articles
            .into_iter()
            .filter_map(|a| a.title)
            .collect();
        if headlines.is_empty() {
            return Ok(None);
        }

        let scores: Vec<f64> = headlines.iter().map(|h| Self::score_headline(h)).collect();
        let avg_sentiment = scores.iter().sum::<f64>() / scores.len() as f64;
        let confidence = (headlines.len() as f64 / 20.0).min(1.0);

        Ok(Some(NewsSentiment {
            avg_sentiment,
            headline_count: headlines.len(),
            confidence,
            // Scaled into log-odds; a uniformly positive page of headlines
            // moves the posterior by roughly 0.3 in logit space.
            llr: avg_sentiment * 0.3 * confidence,
            headlines,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn headline_scoring_is_directional() {
        assert!(NewsApiClient::score_headline("Candidate wins key county, rally continues") > 0.0);
        assert!(NewsApiClient::score_headline("Campaign fails, support collapses") < 0.0);
        assert_eq!(NewsApiClient::score_headline("Election scheduled for Tuesday"), 0.0);
    }

    #[tokio::test]
    async fn null_provider_returns_none() {
        let provider = NullSentimentProvider;
        assert!(provider.sentiment_for("anything").await.unwrap().is_none());
    }
}
