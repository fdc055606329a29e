use crate::{config::PipelineConfig, requests::RequestClient, term::TermYearExtractor};

/// Everything one run needs besides the store, built fresh per run.
pub struct PipelineContext {
    pub config: PipelineConfig,
    pub year_extractor: TermYearExtractor,
    pub request_client: RequestClient,
}

impl PipelineContext {
    pub fn new(config: PipelineConfig) -> anyhow::Result<Self> {
        let year_extractor = TermYearExtractor::new()?;
        let request_client = RequestClient::new(
            &config.anex_base_url,
            config.requests_per_second,
            config.min_request_gap,
        )?;
        Ok(PipelineContext {
            config,
            year_extractor,
            request_client,
        })
    }
}
