use anyhow::Result;

#[derive(Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database_url: String,
    pub booking: BookingConfig,
    pub payments: PaymentsConfig,
}

#[derive(Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Clone)]
pub struct BookingConfig {
    /// Unpaid bookings older than this are expired by the sweeper.
    pub expiry_minutes: i64,
    pub sweep_interval_secs: u64,
    pub sweep_batch_size: i64,
    /// Confirmed bookings starting within this window get a reminder.
    pub reminder_lead_minutes: i64,
}

#[derive(Clone)]
pub struct PaymentsConfig {
    pub provider_timeout_secs: u64,
    pub webhook_max_retries: i32,
    pub webhook_backoff_base_ms: u64,
    pub webhook_backoff_cap_ms: u64,
    pub idempotency_ttl_hours: i64,
    pub providers: Vec<ProviderConfig>,
}

#[derive(Clone)]
pub struct ProviderConfig {
    pub name: String,
    pub base_url: String,
    pub api_key: String,
    pub webhook_secret: String,
}

fn env_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let providers = env_str("PAYMENT_PROVIDERS", "mockpay")
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .map(|name| {
                let upper = name.to_uppercase().replace('-', "_");
                ProviderConfig {
                    base_url: env_str(
                        &format!("{upper}_BASE_URL"),
                        "http://localhost:9750",
                    ),
                    api_key: env_str(&format!("{upper}_API_KEY"), ""),
                    webhook_secret: env_str(&format!("{upper}_WEBHOOK_SECRET"), ""),
                    name,
                }
            })
            .collect();

        Ok(Self {
            server: ServerConfig {
                host: env_str("SERVER_HOST", "127.0.0.1"),
                port: env_parse("SERVER_PORT", 8080),
            },
            database_url: env_str(
                "DATABASE_URL",
                "postgres://bookserver:@localhost:5432/bookserver",
            ),
            booking: BookingConfig {
                expiry_minutes: env_parse("BOOKING_EXPIRY_MINUTES", 60),
                sweep_interval_secs: env_parse("SWEEP_INTERVAL_SECS", 1800),
                sweep_batch_size: env_parse("SWEEP_BATCH_SIZE", 100),
                reminder_lead_minutes: env_parse("REMINDER_LEAD_MINUTES", 24 * 60),
            },
            payments: PaymentsConfig {
                provider_timeout_secs: env_parse("PROVIDER_TIMEOUT_SECS", 15),
                webhook_max_retries: env_parse("WEBHOOK_MAX_RETRIES", 5),
                webhook_backoff_base_ms: env_parse("WEBHOOK_BACKOFF_BASE_MS", 500),
                webhook_backoff_cap_ms: env_parse("WEBHOOK_BACKOFF_CAP_MS", 60_000),
                idempotency_ttl_hours: env_parse("IDEMPOTENCY_TTL_HOURS", 24),
                providers,
            },
        })
    }

    pub fn provider(&self, name: &str) -> Option<&ProviderConfig> {
        self.payments.providers.iter().find(|p| p.name == name)
    }
}
