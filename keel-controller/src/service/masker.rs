//! Secret masking for captured build logs

/// Values shorter than this are too likely to appear by accident
const MIN_SECRET_LEN: usize = 6;
const MASK: &str = "*****";

/// Replaces known secret values in log lines
#[derive(Debug, Clone, Default)]
pub struct LogMasker {
    secrets: Vec<String>,
}

impl LogMasker {
    /// Multi-line values are masked line by line
    pub fn new(values: impl IntoIterator<Item = String>) -> Self {
        let mut secrets: Vec<String> = values
            .into_iter()
            .flat_map(|value| {
                value
                    .lines()
                    .map(|line| line.trim().to_string())
                    .collect::<Vec<_>>()
            })
            .filter(|value| value.len() >= MIN_SECRET_LEN)
            .collect();
        // longest first so a secret containing another is masked whole
        secrets.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
        secrets.dedup();
        Self { secrets }
    }

    pub fn mask(&self, line: &str) -> String {
        let mut masked = line.to_string();
        for secret in &self.secrets {
            if masked.contains(secret.as_str()) {
                masked = masked.replace(secret.as_str(), MASK);
            }
        }
        masked
    }
}
