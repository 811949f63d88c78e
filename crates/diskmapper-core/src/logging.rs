//! Logger bootstrap shared by the binaries.

use std::io::Write;

const FORMAT_ENV: &str = "DISK_MAPPER_LOG_FORMAT";

/// Install the global logger. `RUST_LOG` overrides `default_level`.
///
/// Setting `DISK_MAPPER_LOG_FORMAT=json` switches to one JSON object per line.
/// Calling this more than once is harmless.
pub fn init(default_level: &str) {
    let env = env_logger::Env::default().default_filter_or(default_level);
    let mut builder = env_logger::Builder::from_env(env);

    let json = std::env::var(FORMAT_ENV)
        .map(|value| value.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    if json {
        builder.format(|buf, record| {
            let line = serde_json::json!({
                "ts": buf.timestamp_millis().to_string(),
                "level": record.level().as_str(),
                "logger": record.target(),
                "msg": record.args().to_string(),
            });
            writeln!(buf, "{line}")
        });
    }

    let _ = builder.try_init();
}
