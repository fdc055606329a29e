use std::{num::NonZeroU32, time::Duration};

use reqwest::{
    Client, ClientBuilder,
    header::{ACCEPT, HeaderMap, HeaderValue, REFERER},
};

use crate::{
    fetcher::{Transport, TransportError, TransportResponse},
    ratelimit::RateLimiter,
    records::WorkItem,
};

const GRADES_PATH: &str = "/grades/getData/";

pub struct RequestClient {
    client: Client,
    rate_limiter: RateLimiter,
    grades_url: String,
    referer: String,
}

impl RequestClient {
    pub fn new(
        base_url: &str,
        req_per_sec: NonZeroU32,
        min_gap: Duration,
    ) -> anyhow::Result<Self> {
        let base_url = base_url.trim_end_matches('/');

        let mut headers = HeaderMap::new();
        headers.insert(
            ACCEPT,
            HeaderValue::from_static("application/json, text/javascript, */*; q=0.01"),
        );
        headers.insert(
            "x-requested-with",
            HeaderValue::from_static("XMLHttpRequest"),
        );
        let client = ClientBuilder::new().default_headers(headers).build()?;

        Ok(Self {
            client,
            rate_limiter: RateLimiter::new(req_per_sec, min_gap),
            grades_url: format!("{base_url}{GRADES_PATH}"),
            referer: format!("{base_url}/grades/"),
        })
    }

    pub async fn post_grades_form(&self, item: &WorkItem) -> reqwest::Result<TransportResponse> {
        // Wait (non-blocking) until we're allowed to make a request according
        // to our self-imposed rate-limiting policy.
        self.rate_limiter.wait_until_ready().await;

        let form = [
            ("dept", item.dept.as_str()),
            ("number", item.course_number.as_str()),
        ];
        let response = self
            .client
            .post(&self.grades_url)
            .header(REFERER, &self.referer)
            .form(&form)
            .send()
            .await?;
        let status = response.status().as_u16();
        let body = response.text().await?;
        Ok(TransportResponse { status, body })
    }
}

impl Transport for RequestClient {
    async fn request(&self, item: &WorkItem) -> Result<TransportResponse, TransportError> {
        self.post_grades_form(item).await.map_err(|e| {
            if e.is_timeout() {
                TransportError::Timeout
            } else {
                TransportError::Other(e.to_string())
            }
        })
    }
}
