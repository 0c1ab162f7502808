pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

/// Builder for a single shell line with every argument quoted.
#[derive(Debug, Clone)]
pub struct ShellCommand {
    parts: Vec<String>,
}

impl ShellCommand {
    pub fn new(program: &str) -> Self {
        Self {
            parts: vec![program.to_string()],
        }
    }

    pub fn arg(mut self, arg: &str) -> Self {
        self.parts.push(shell_quote(arg));
        self
    }

    /// Appends `s` without quoting.
    pub fn raw(mut self, s: &str) -> Self {
        self.parts.push(s.to_string());
        self
    }

    pub fn and(self, other: ShellCommand) -> Self {
        self.raw("&&").merge(other)
    }

    pub fn redirect_out(self, path: &str) -> Self {
        self.raw(">").raw(&shell_quote(path))
    }

    fn merge(mut self, other: ShellCommand) -> Self {
        self.parts.extend(other.parts);
        self
    }

    pub fn to_shell_string(&self) -> String {
        self.parts.join(" ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_quote_with_single_quote() {
        assert_eq!(shell_quote("it's"), "'it'\\''s'");
    }

    #[test]
    fn test_copy_then_chmod() {
        let cmd = ShellCommand::new("cp")
            .arg("/scratch/jobs/abc/input")
            .arg(".task_command")
            .and(ShellCommand::new("chmod").arg("+x").arg(".task_command"));
        assert_eq!(
            cmd.to_shell_string(),
            "cp '/scratch/jobs/abc/input' '.task_command' && chmod '+x' '.task_command'"
        );
    }

    #[test]
    fn test_redirect_quotes_path() {
        let cmd = ShellCommand::new("echo")
            .arg("ok")
            .redirect_out("status file");
        assert_eq!(cmd.to_shell_string(), "echo 'ok' > 'status file'");
    }
}
