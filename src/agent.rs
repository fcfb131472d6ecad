use crate::config::CommandConfig;

/// The external agent CLI, as configured.
#[derive(Debug, Clone)]
pub struct AgentCommand {
    config: CommandConfig,
}

impl AgentCommand {
    pub fn from_config(config: &CommandConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }

    pub fn binary(&self) -> &str {
        &self.config.executable
    }

    /// Full argv (without the binary) for one invocation.
    pub fn args(&self, model: &str, prompt: &str) -> Vec<String> {
        self.config.render_args(model, prompt)
    }

    /// Whether output should be passed through without decoding events.
    pub fn raw_output(&self) -> bool {
        self.config.raw_output
    }

    pub fn is_available(&self) -> bool {
        which::which(self.binary()).is_ok()
    }
}
