use tracing_subscriber::{prelude::*, EnvFilter, Registry};

/// Maps the operator's numeric verbosity onto a filter directive
fn verbosity_directive(verbosity: &str) -> &'static str {
    match verbosity.trim().parse::<u8>() {
        Ok(0) => "error",
        Ok(1) => "warn",
        Ok(2) | Ok(3) => "info",
        Ok(4) | Ok(5) => "debug",
        Ok(_) => "trace",
        Err(_) => "info",
    }
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = std::env::var("VIRT_OPERATOR_VERBOSITY")
            .map(|v| verbosity_directive(&v))
            .unwrap_or("info");
        EnvFilter::new(level)
    })
}

/// Initialize tracing
pub fn init(json: bool) {
    let reg = Registry::default().with(env_filter());
    if json {
        reg.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        reg.with(tracing_subscriber::fmt::layer().compact()).init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbosity_maps_to_levels() {
        assert_eq!(verbosity_directive("2"), "info");
        assert_eq!(verbosity_directive("4"), "debug");
        assert_eq!(verbosity_directive("9"), "trace");
        assert_eq!(verbosity_directive("loud"), "info");
    }
}
