use async_trait::async_trait;
use std::sync::Arc;
use vps_runtime::{ContainerRuntime, RuntimeError};

/// Reports how full an instance's root filesystem is, in percent.
#[async_trait]
pub trait DiskUsageProbe: Send + Sync {
    async fn root_usage_percent(&self, container_id: &str) -> Result<f64, RuntimeError>;
}

/// Runs `df -P /` inside the container.
pub struct DfProbe {
    runtime: Arc<dyn ContainerRuntime>,
}

impl DfProbe {
    pub fn new(runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self { runtime }
    }
}

#[async_trait]
impl DiskUsageProbe for DfProbe {
    async fn root_usage_percent(&self, container_id: &str) -> Result<f64, RuntimeError> {
        let cmd = ["df", "-P", "/"].map(String::from);
        let output = self.runtime.exec(container_id, &cmd).await?;
        parse_df_percent(&output).ok_or_else(|| {
            RuntimeError::Exec(format!("unrecognised df output: {}", output.trim()))
        })
    }
}

/// Extract the capacity column for `/` from POSIX `df` output.
pub fn parse_df_percent(output: &str) -> Option<f64> {
    let rows: Vec<Vec<&str>> = output
        .lines()
        .skip(1)
        .map(|line| line.split_whitespace().collect::<Vec<_>>())
        .filter(|fields| !fields.is_empty())
        .collect();

    let row = rows
        .iter()
        .find(|fields| fields.last() == Some(&"/"))
        .or_else(|| (rows.len() == 1).then(|| &rows[0]))?;

    row.iter()
        .find_map(|field| field.strip_suffix('%'))
        .and_then(|pct| pct.parse::<f64>().ok())
        .filter(|pct| (0.0..=100.0).contains(pct))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_posix_df() {
        let out = "Filesystem     1024-blocks     Used Available Capacity Mounted on\n\
                   overlay           61255652 29389824  28724020      51% /\n";
        assert_eq!(parse_df_percent(out), Some(51.0));
    }

    #[test]
    fn test_parse_picks_root_mount() {
        let out = "Filesystem 1024-blocks Used Available Capacity Mounted on\n\
                   tmpfs 65536 0 65536 0% /dev\n\
                   overlay 1000 930 70 93% /\n";
        assert_eq!(parse_df_percent(out), Some(93.0));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert_eq!(parse_df_percent(""), None);
        assert_eq!(parse_df_percent("df: /: No such file or directory"), None);
        let two_rows_no_root = "h\nfs 1 1 0 50% /a\nfs 1 1 0 60% /b\n";
        assert_eq!(parse_df_percent(two_rows_no_root), None);
    }
}
