use std::time::Duration;

use anyhow::{Context, Result, bail};

/// utime + stime of a process, in clock ticks.
pub fn parse_process_ticks(stat: &str) -> Result<u64> {
    // the command name may itself contain spaces and parentheses
    let Some((_, rest)) = stat.rsplit_once(')') else {
        bail!("malformed process stat");
    };

    let fields: Vec<&str> = rest.split_whitespace().collect();
    let (Some(utime), Some(stime)) = (fields.get(11), fields.get(12)) else {
        bail!("process stat is missing cpu fields");
    };

    Ok(utime.parse::<u64>()? + stime.parse::<u64>()?)
}

/// Sum of all fields of the aggregate `cpu` line of /proc/stat.
pub fn parse_total_ticks(stat: &str) -> Result<u64> {
    let Some(line) = stat.lines().find(|l| l.starts_with("cpu ")) else {
        bail!("no aggregate cpu line");
    };

    line.split_whitespace()
        .skip(1)
        .map(|v| v.parse::<u64>().context("bad cpu field"))
        .sum()
}

/// Resident set size in bytes from /proc/<pid>/status.
pub fn parse_rss_bytes(status: &str) -> Result<u64> {
    let Some(line) = status.lines().find(|l| l.starts_with("VmRSS:")) else {
        bail!("no VmRSS entry");
    };

    let kib = line
        .split_whitespace()
        .nth(1)
        .context("empty VmRSS entry")?
        .parse::<u64>()?;
    Ok(kib * 1024)
}

pub fn cpu_percent(process_delta: u64, total_delta: u64) -> f32 {
    if total_delta == 0 {
        return 0.0;
    }
    100.0 * process_delta as f32 / total_delta as f32
}

/// Host-wide cpu time, in clock ticks.
pub async fn total_ticks() -> Result<u64> {
    let total = tokio::fs::read_to_string("/proc/stat").await?;
    parse_total_ticks(&total)
}

async fn ticks(pid: i32) -> Result<(u64, u64)> {
    let process = tokio::fs::read_to_string(format!("/proc/{pid}/stat")).await?;

    Ok((parse_process_ticks(&process)?, total_ticks().await?))
}

/// Samples cpu usage of `pid` over `window`, and its resident memory.
pub async fn sample_process(pid: i32, window: Duration) -> Result<(f32, u64)> {
    let (process_before, total_before) = ticks(pid).await?;
    tokio::time::sleep(window).await;
    let (process_after, total_after) = ticks(pid).await?;

    let status = tokio::fs::read_to_string(format!("/proc/{pid}/status")).await?;
    let rss = parse_rss_bytes(&status)?;

    Ok((
        cpu_percent(
            process_after.saturating_sub(process_before),
            total_after.saturating_sub(total_before),
        ),
        rss,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_process_ticks() {
        let stat = "4242 (qemu (kvm) x) S 1 4242 4242 0 -1 4194560 1000 0 0 0 150 50 0 0 20 0 3 0";
        assert_eq!(parse_process_ticks(stat).unwrap(), 200);
        assert!(parse_process_ticks("4242 qemu").is_err());
    }

    #[test]
    fn test_parse_total_ticks() {
        let stat = "cpu  100 0 50 800 10 0 40 0 0 0\ncpu0 50 0 25 400 5 0 20 0 0 0\n";
        assert_eq!(parse_total_ticks(stat).unwrap(), 1000);
    }

    #[test]
    fn test_parse_rss_and_percent() {
        let status = "Name:\tqemu\nVmRSS:\t  262144 kB\nThreads:\t3\n";
        assert_eq!(parse_rss_bytes(status).unwrap(), 256 * 1024 * 1024);

        assert_eq!(cpu_percent(25, 100), 25.0);
        assert_eq!(cpu_percent(5, 0), 0.0);
    }

    #[tokio::test]
    async fn test_sample_own_process() {
        let pid = std::process::id() as i32;
        let (cpu, rss) = sample_process(pid, Duration::from_millis(20)).await.unwrap();

        assert!(cpu >= 0.0);
        assert!(rss > 0);
    }
}
