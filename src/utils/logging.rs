use tracing_subscriber::EnvFilter;

/// `RUST_LOG` if set, otherwise info with ONNX Runtime held to warnings.
pub fn env_filter() -> EnvFilter {
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,ort=warn".to_string());
    EnvFilter::new(filter)
}

pub fn init() {
    tracing_subscriber::fmt().with_env_filter(env_filter()).with_ansi(false).init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_filter_quiets_ort() {
        let saved = std::env::var("RUST_LOG").ok();
        std::env::remove_var("RUST_LOG");
        let directives = env_filter().to_string();
        assert!(directives.contains("ort=warn"), "{}", directives);

        std::env::set_var("RUST_LOG", "debug");
        assert_eq!(env_filter().to_string(), "debug");

        match saved {
            Some(v) => std::env::set_var("RUST_LOG", v),
            None => std::env::remove_var("RUST_LOG"),
        }
    }
}
