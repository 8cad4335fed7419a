// src/config.rs

use std::env;
use dotenvy::dotenv;

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub rust_log: String,
    pub assessment: AssessmentSpec,
}

/// The shape of the assessment being scanned: how many pages and questions
/// each paper has, how many versions exist, and the public code printed
/// into every QR code of this assessment.
#[derive(Debug, Clone)]
pub struct AssessmentSpec {
    pub pages_per_paper: i64,
    pub questions_per_paper: i64,
    pub n_versions: i64,
    pub public_code: String,
}

impl Config {
    pub fn from_env() -> Self {
        dotenv().ok();

        let database_url = env::var("DATABASE_URL")
            .expect("DATABASE_URL must be set");

        let rust_log = env::var("RUST_LOG")
            .unwrap_or_else(|_| "info".to_string());

        let assessment = AssessmentSpec {
            pages_per_paper: parse_env_int("ASSESSMENT_PAGES", 6),
            questions_per_paper: parse_env_int("ASSESSMENT_QUESTIONS", 4),
            n_versions: parse_env_int("ASSESSMENT_VERSIONS", 1),
            public_code: env::var("ASSESSMENT_PUBLIC_CODE")
                .unwrap_or_else(|_| "00000".to_string()),
        };

        Self {
            database_url,
            rust_log,
            assessment,
        }
    }
}

fn parse_env_int(key: &str, default: i64) -> i64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
