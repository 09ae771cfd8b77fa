//! `turnflow config` — Configuration management commands.

use turnflow_config::AppConfig;

pub async fn validate() -> Result<(), Box<dyn std::error::Error>> {
    println!("🔍 Validating configuration...");

    match AppConfig::load() {
        Ok(config) => {
            println!("   ✅ Config parsed successfully");

            // Checks that are legal but probably unintended
            let mut warnings = Vec::new();

            if !config.has_api_key() {
                warnings.push("No API key set (set TURNFLOW_API_KEY or OPENAI_API_KEY env var)");
            }

            if config.max_tokens <= config.context.token_ceiling {
                warnings.push("max_tokens leaves no headroom above context.token_ceiling; responses get the floor");
            }

            if config.storage.backend == "memory" {
                warnings.push("In-memory storage: conversations are lost on exit");
            }

            if warnings.is_empty() {
                println!("   ✅ All checks passed");
            } else {
                println!();
                for w in &warnings {
                    println!("   ⚠️  {w}");
                }
            }

            println!();
            println!("   Provider:  {}", config.provider.api_url);
            println!("   Model:     {}", config.default_model);
            println!(
                "   Context:   {} tokens, batch of {}",
                config.context.token_ceiling, config.context.recent_batch_size
            );
            println!(
                "   Response:  {}..{} tokens",
                config.inference.min_response_tokens, config.inference.max_response_tokens
            );
            println!("   Storage:   {}", config.storage.backend);
        }
        Err(e) => {
            println!("   ❌ Config error: {e}");
            return Err(e.into());
        }
    }

    Ok(())
}

pub async fn show() -> Result<(), Box<dyn std::error::Error>> {
    let mut config = AppConfig::load().map_err(|e| format!("Failed to load config: {e}"))?;
    if config.provider.api_key.is_some() {
        config.provider.api_key = Some("***".into());
    }
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}

pub async fn path() -> Result<(), Box<dyn std::error::Error>> {
    let config_path = AppConfig::config_dir().join("config.toml");
    println!("{}", config_path.display());
    Ok(())
}

pub async fn print_default() -> Result<(), Box<dyn std::error::Error>> {
    print!("{}", AppConfig::default_toml());
    Ok(())
}
