use serde::Serialize;

/// Per-file outcome counts of one import run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ImportResult {
    pub success: usize,
    pub failure: usize,
}

impl ImportResult {
    pub fn summary(&self) -> String {
        let mut message = format!(
            "Congratulations! Your listens from {} files have been uploaded successfully.",
            self.success
        );
        if self.failure > 0 {
            message.push_str(&format!(" {} files could not be read.", self.failure));
        }
        message
    }
}

/// Counters accumulated while walking archive entries. Only aggregates are
/// kept; which entries failed is not retained.
#[derive(Debug, Default)]
pub struct ImportStats {
    success: usize,
    failure: usize,
}

impl ImportStats {
    pub fn record_success(&mut self) {
        self.success += 1;
    }

    pub fn record_failure(&mut self) {
        self.failure += 1;
    }

    pub fn into_result(self) -> ImportResult {
        ImportResult {
            success: self.success,
            failure: self.failure,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ImportResponse {
    pub success: usize,
    pub failure: usize,
    pub message: String,
}

impl From<ImportResult> for ImportResponse {
    fn from(result: ImportResult) -> Self {
        ImportResponse {
            success: result.success,
            failure: result.failure,
            message: result.summary(),
        }
    }
}
