//! Answer sources for keyboard-interactive prompts: configured answers keyed
//! by the hex of the question text, TOTP secrets, OTP commands, and numeric
//! fallbacks.

use std::collections::HashSet;

use data_encoding::HEXLOWER;
use passage_common::helpers::otp::totp_code;
use passage_common::Secret;
use passage_core::Services;
use tracing::*;

pub struct InteractiveAnswers {
    alias: String,
    index: usize,
    seen: HashSet<String>,
    tried: HashSet<String>,
    warned: HashSet<String>,
}

impl InteractiveAnswers {
    pub fn new(alias: &str) -> Self {
        Self {
            alias: alias.to_owned(),
            index: 0,
            seen: HashSet::new(),
            tried: HashSet::new(),
            warned: HashSet::new(),
        }
    }

    /// Resolves a configured answer for one prompt. `None` means the caller
    /// should fall back to asking the user.
    pub async fn answer_for(
        &mut self,
        services: &Services,
        question: &str,
    ) -> Option<Secret<String>> {
        self.index += 1;
        let question = question.trim();
        let hex = HEXLOWER.encode(question.as_bytes());

        let repeated = !self.seen.insert(hex.clone());
        if repeated && self.tried.contains(&hex) {
            // The server asked the same question again: the configured
            // answer was rejected. Warn once per question.
            if self.warned.insert(hex.clone()) {
                warn!(%question, "configured answer appears to be incorrect");
            }
            return None;
        }

        let answer = self.lookup(services, &hex).await;
        if answer.is_some() {
            self.tried.insert(hex);
        }
        answer
    }

    async fn lookup(&self, services: &Services, hex: &str) -> Option<Secret<String>> {
        let alias = &self.alias;
        if let Some(answer) = services.secrets.get_secret(alias, hex) {
            return Some(answer);
        }
        if let Some(secret) = services.secrets.get_secret(alias, &format!("totp{hex}")) {
            return self.totp(&secret);
        }
        if let Some(command) = services.secrets.get_secret(alias, &format!("otp{hex}")) {
            return self.run_otp_command(command.expose_secret()).await;
        }
        let index = self.index;
        if let Some(answer) = services
            .secrets
            .get_secret(alias, &format!("QuestionAnswer{index}"))
        {
            return Some(answer);
        }
        if let Some(secret) = services
            .secrets
            .get_secret(alias, &format!("TotpSecret{index}"))
        {
            return self.totp(&secret);
        }
        if let Some(command) = services
            .secrets
            .get_secret(alias, &format!("OtpCommand{index}"))
        {
            return self.run_otp_command(command.expose_secret()).await;
        }
        None
    }

    fn totp(&self, secret: &Secret<String>) -> Option<Secret<String>> {
        match totp_code(secret) {
            Ok(code) => Some(code),
            Err(error) => {
                warn!(%error, "cannot compute TOTP code");
                None
            }
        }
    }

    async fn run_otp_command(&self, command: &str) -> Option<Secret<String>> {
        let argv = match shell_words::split(command) {
            Ok(argv) if !argv.is_empty() => argv,
            _ => {
                warn!(%command, "cannot parse OTP command");
                return None;
            }
        };
        let output = tokio::process::Command::new(&argv[0])
            .args(&argv[1..])
            .output()
            .await;
        match output {
            Ok(output) if output.status.success() => {
                let code = String::from_utf8_lossy(&output.stdout).trim().to_owned();
                (!code.is_empty()).then(|| Secret::new(code))
            }
            Ok(output) => {
                warn!(status = ?output.status, "OTP command failed");
                None
            }
            Err(error) => {
                warn!(%error, "cannot run OTP command");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;

    fn services_with_secrets(tag: &str, content: &str) -> Services {
        let dir = std::env::temp_dir().join(format!(
            "passage-interactive-{tag}-{}",
            std::process::id()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("secrets"), content).unwrap();
        // an empty config next to the secrets file keeps the store isolated
        std::fs::write(dir.join("config"), "").unwrap();
        build_services(&dir)
    }

    fn build_services(dir: &Path) -> Services {
        use passage_core::config::{ConfigStore, SecretStore};
        use passage_core::Lifecycle;
        use std::sync::Arc;
        Services {
            config: Arc::new(ConfigStore::load(&dir.join("config"), &dir.join("config"))),
            secrets: Arc::new(SecretStore::load(&dir.join("secrets"))),
            lifecycle: Lifecycle::new(),
        }
    }

    #[tokio::test]
    async fn test_hex_keyed_answer() {
        let hex = HEXLOWER.encode(b"Verification code:");
        let services = services_with_secrets("hex", &format!("Host web\n  {hex} 123456\n"));
        let mut answers = InteractiveAnswers::new("web");
        let answer = answers
            .answer_for(&services, "Verification code:")
            .await
            .unwrap();
        assert_eq!(answer.expose_secret(), "123456");
    }

    #[tokio::test]
    async fn test_numeric_fallback_and_repeat_warning() {
        let services = services_with_secrets("numeric", "Host web\n  QuestionAnswer1 alpha\n");
        let mut answers = InteractiveAnswers::new("web");
        let first = answers.answer_for(&services, "Challenge?").await;
        assert_eq!(first.unwrap().expose_secret(), "alpha");
        // the same question again means the answer was wrong: no retry loop
        let second = answers.answer_for(&services, "Challenge?").await;
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn test_unknown_question() {
        let services = services_with_secrets("unknown", "Host web\n  QuestionAnswer2 beta\n");
        let mut answers = InteractiveAnswers::new("web");
        assert!(answers.answer_for(&services, "Who?").await.is_none());
    }
}
