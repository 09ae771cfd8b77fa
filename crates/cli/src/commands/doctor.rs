//! `turnflow doctor` — Diagnose system health.

use turnflow_config::AppConfig;
use turnflow_core::provider::Provider;
use turnflow_core::store::Store;
use turnflow_providers::OpenAiCompatProvider;

pub async fn run() -> Result<(), Box<dyn std::error::Error>> {
    println!("🩺 Turnflow Doctor — System Diagnostics");
    println!("=======================================\n");

    let mut issues = 0;

    // Check config
    let config_path = AppConfig::config_dir().join("config.toml");
    if !config_path.exists() {
        println!("  ⚠️  No config file at {} (using defaults)", config_path.display());
    }
    let config = match AppConfig::load() {
        Ok(config) => {
            println!("  ✅ Config valid");
            config
        }
        Err(e) => {
            println!("  ❌ Config invalid: {e}");
            println!("\n  ⚠️  1 issue(s) found. See above for details.");
            return Ok(());
        }
    };

    // Check storage
    match super::open_store(&config).await {
        Ok(store) => match store.recent_events(1).await {
            Ok(_) => println!("  ✅ Storage ready ({})", store.name()),
            Err(e) => {
                println!("  ❌ Storage query failed: {e}");
                issues += 1;
            }
        },
        Err(e) => {
            println!("  ❌ Storage unavailable: {e}");
            issues += 1;
        }
    }

    // Check provider
    if !config.has_api_key() {
        println!("  ⚠️  No API key configured — set TURNFLOW_API_KEY or add provider.api_key");
        issues += 1;
    } else {
        match OpenAiCompatProvider::from_config(&config.provider) {
            Ok(provider) => match provider.health_check().await {
                Ok(true) => println!("  ✅ Provider reachable ({})", provider.base_url()),
                Ok(false) => {
                    println!("  ⚠️  Provider responded but reported unhealthy");
                    issues += 1;
                }
                Err(e) => {
                    println!("  ❌ Provider unreachable: {e}");
                    issues += 1;
                }
            },
            Err(e) => {
                println!("  ❌ Provider misconfigured: {e}");
                issues += 1;
            }
        }
    }

    // Check tools
    let registry = turnflow_tools::default_registry();
    println!("  ✅ {} built-in tool(s): {}", registry.len(), registry.names().join(", "));

    // Summary
    println!();
    if issues == 0 {
        println!("  🎉 All checks passed!");
    } else {
        println!("  ⚠️  {issues} issue(s) found. See above for details.");
    }

    Ok(())
}
