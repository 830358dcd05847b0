use std::io::Write;
use std::sync::Once;

use chrono::Utc;

static INIT: Once = Once::new();

/// Environment variable selecting `json` or `text` (default) log lines
const LOG_FORMAT_ENV: &str = "LIVE_TRANSLATE_LOG_FORMAT";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LogFormat {
    Text,
    Json,
}

impl LogFormat {
    fn from_env() -> Self {
        match std::env::var(LOG_FORMAT_ENV) {
            Ok(value) if value.eq_ignore_ascii_case("json") => LogFormat::Json,
            _ => LogFormat::Text,
        }
    }
}

/// Install the global logger once
///
/// Level defaults to `info` and follows `RUST_LOG` when set. Safe to call
/// more than once.
pub fn init() {
    INIT.call_once(|| {
        let format = LogFormat::from_env();
        let mut builder =
            env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));

        builder.format(move |buf, record| {
            let ts = Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
            match format {
                LogFormat::Json => {
                    let obj = serde_json::json!({
                        "ts": ts,
                        "level": record.level().to_string(),
                        "target": record.target(),
                        "msg": record.args().to_string(),
                    });
                    writeln!(buf, "{}", obj)
                }
                LogFormat::Text => writeln!(
                    buf,
                    "{} {:<5} {} {}",
                    ts,
                    record.level(),
                    record.target(),
                    record.args()
                ),
            }
        });

        if let Err(e) = builder.try_init() {
            eprintln!("[logging] logger already installed: {}", e);
        }
    });
}
