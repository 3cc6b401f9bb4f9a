use anyhow::Result;

use crate::browser;
use crate::config::Config;

/// Print configured sources and whether the browser endpoint answers.
pub async fn list_sources(config: &Config) -> Result<()> {
    let discovery_url = config.browser.discovery_url();
    match browser::discover(&discovery_url, config.browser.connect_timeout()).await {
        Ok(ws_url) => println!("browser: reachable ({})", ws_url),
        Err(e) => {
            tracing::debug!(error = %e, "Browser probe failed");
            println!("browser: unreachable ({})", discovery_url);
        }
    }
    println!();

    if config.sources.is_empty() {
        println!("No sources configured.");
        return Ok(());
    }

    println!("{:<16} {:<16} {:<8} FEED", "SOURCE", "NAMESPACE", "COOKIE");
    for (name, source) in &config.sources {
        let cookie = match &source.cookie_env {
            Some(var) if std::env::var(var).map(|v| !v.trim().is_empty()).unwrap_or(false) => "set",
            Some(_) => "missing",
            None => "-",
        };
        println!(
            "{:<16} {:<16} {:<8} {}",
            name, source.namespace, cookie, source.feed_url
        );
    }

    Ok(())
}
