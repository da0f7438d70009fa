//! Dev container steps: system packages, Python and Node toolchains,
//! Docker and certbot extras, shell configuration, bootstrap scripts.

use anyhow::{Result, bail};
use orchestrate::{BoxedStep, CheckOutcome, Step, StepContext, Target};
use std::time::Duration;

use crate::config::Config;
use crate::steps::containers;

pub const PACKAGES: &str = "dev.packages";
pub const PYTHON: &str = "dev.python";
pub const NODE: &str = "dev.node";
pub const DOCKER: &str = "dev.docker";
pub const CERTBOT: &str = "dev.certbot";
pub const SHELL: &str = "dev.shell";
pub const SCRIPTS: &str = "dev.scripts";

const BASHRC_MARKER: &str = "# vibehost dev environment";

pub fn steps(config: &Config) -> Vec<BoxedStep> {
    let setup = &config.dev_setup;
    let mut steps: Vec<BoxedStep> = vec![
        Box::new(DevPackages {
            packages: setup.packages.clone(),
        }),
        Box::new(DevPython {
            global_packages: setup.python.global_packages.clone(),
        }),
        Box::new(DevNode {
            version: setup.node.version.clone(),
            global_packages: setup.node.global_packages.clone(),
        }),
        Box::new(DevShell),
        Box::new(DevScripts),
    ];
    if setup.extras.docker {
        steps.push(Box::new(DevDocker));
    }
    if setup.extras.certbot {
        steps.push(Box::new(DevCertbot));
    }
    steps
}

fn dev_target() -> Target {
    Target::Container("dev".to_string())
}

struct DevPackages {
    packages: Vec<String>,
}

impl Step for DevPackages {
    fn id(&self) -> String {
        PACKAGES.to_string()
    }
    fn phase(&self) -> &'static str {
        "dev-setup"
    }
    fn target(&self) -> Target {
        dev_target()
    }
    fn depends_on(&self) -> Vec<String> {
        vec![containers::ssh_id("dev")]
    }
    fn description(&self) -> String {
        format!("Install {} system packages in dev", self.packages.len())
    }
    fn timeout(&self) -> Option<Duration> {
        Some(Duration::from_secs(900))
    }

    fn check(&self, ctx: &StepContext) -> Result<CheckOutcome> {
        if self.packages.is_empty() {
            return Ok(CheckOutcome::AlreadyApplied);
        }
        let out = ctx.run(&format!(
            "dpkg -s {} > /dev/null 2>&1",
            self.packages.join(" ")
        ))?;
        Ok(if out.success() {
            CheckOutcome::AlreadyApplied
        } else {
            CheckOutcome::NotApplied
        })
    }

    fn action(&self, ctx: &StepContext) -> Result<()> {
        ctx.run_checked(&format!(
            "apt-get update && apt-get install -y {}",
            self.packages.join(" ")
        ))?;
        Ok(())
    }
}

struct DevPython {
    global_packages: Vec<String>,
}

impl Step for DevPython {
    fn id(&self) -> String {
        PYTHON.to_string()
    }
    fn phase(&self) -> &'static str {
        "dev-setup"
    }
    fn target(&self) -> Target {
        dev_target()
    }
    fn depends_on(&self) -> Vec<String> {
        vec![PACKAGES.to_string()]
    }
    fn description(&self) -> String {
        "Install Python toolchain with uv".to_string()
    }
    fn timeout(&self) -> Option<Duration> {
        Some(Duration::from_secs(900))
    }

    fn check(&self, ctx: &StepContext) -> Result<CheckOutcome> {
        let out = ctx.run("test -x /root/.local/bin/uv")?;
        Ok(if out.success() {
            CheckOutcome::AlreadyApplied
        } else {
            CheckOutcome::NotApplied
        })
    }

    fn action(&self, ctx: &StepContext) -> Result<()> {
        ctx.run_checked("apt-get install -y python3 python3-venv python3-pip")?;
        ctx.run_checked(
            "update-alternatives --install /usr/bin/python python /usr/bin/python3 1 || true",
        )?;
        ctx.run_checked("curl -LsSf https://astral.sh/uv/install.sh | sh")?;
        ctx.run_checked(
            "grep -q '/root/.local/bin' /root/.bashrc || echo 'export PATH=\"/root/.local/bin:$PATH\"' >> /root/.bashrc",
        )?;
        if !self.global_packages.is_empty() {
            // Debian 13 enforces PEP 668; system installs need the
            // explicit override
            ctx.run_checked(&format!(
                "/root/.local/bin/uv pip install --system --break-system-packages {}",
                self.global_packages.join(" ")
            ))?;
        }
        Ok(())
    }

    fn verify(&self, ctx: &StepContext) -> Result<()> {
        let out = ctx.run("test -x /root/.local/bin/uv && python3 --version")?;
        if !out.success() {
            bail!("python toolchain incomplete");
        }
        Ok(())
    }
}

struct DevNode {
    version: String,
    global_packages: Vec<String>,
}

impl Step for DevNode {
    fn id(&self) -> String {
        NODE.to_string()
    }
    fn phase(&self) -> &'static str {
        "dev-setup"
    }
    fn target(&self) -> Target {
        dev_target()
    }
    fn depends_on(&self) -> Vec<String> {
        vec![PACKAGES.to_string()]
    }
    fn description(&self) -> String {
        format!("Install Node.js {} via NodeSource", self.version)
    }
    fn timeout(&self) -> Option<Duration> {
        Some(Duration::from_secs(900))
    }

    fn check(&self, ctx: &StepContext) -> Result<CheckOutcome> {
        let out = ctx.run("node --version")?;
        Ok(
            if out.success() && out.stdout_trimmed().starts_with(&format!("v{}.", self.version))
            {
                CheckOutcome::AlreadyApplied
            } else {
                CheckOutcome::NotApplied
            },
        )
    }

    fn action(&self, ctx: &StepContext) -> Result<()> {
        ctx.run_checked(&format!(
            "curl -fsSL https://deb.nodesource.com/setup_{}.x | bash -",
            self.version
        ))?;
        ctx.run_checked("apt-get install -y nodejs")?;
        if !self.global_packages.is_empty() {
            ctx.run_checked(&format!(
                "npm install -g {}",
                self.global_packages.join(" ")
            ))?;
        }
        Ok(())
    }

    fn verify(&self, ctx: &StepContext) -> Result<()> {
        let out = ctx.run("node --version")?;
        if !out.success() || !out.stdout_trimmed().starts_with(&format!("v{}.", self.version)) {
            bail!(
                "expected node v{}.x, found '{}'",
                self.version,
                out.stdout_trimmed()
            );
        }
        Ok(())
    }
}

struct DevDocker;

impl Step for DevDocker {
    fn id(&self) -> String {
        DOCKER.to_string()
    }
    fn phase(&self) -> &'static str {
        "dev-setup"
    }
    fn target(&self) -> Target {
        dev_target()
    }
    fn depends_on(&self) -> Vec<String> {
        vec![PACKAGES.to_string()]
    }
    fn description(&self) -> String {
        "Install Docker in the dev container".to_string()
    }
    fn timeout(&self) -> Option<Duration> {
        Some(Duration::from_secs(900))
    }

    fn check(&self, ctx: &StepContext) -> Result<CheckOutcome> {
        let out = ctx.run("docker --version")?;
        Ok(if out.success() {
            CheckOutcome::AlreadyApplied
        } else {
            CheckOutcome::NotApplied
        })
    }

    fn action(&self, ctx: &StepContext) -> Result<()> {
        ctx.run_checked("curl -fsSL https://get.docker.com | sh")?;
        ctx.run_checked("systemctl enable --now docker")?;
        Ok(())
    }

    fn verify(&self, ctx: &StepContext) -> Result<()> {
        let out = ctx.run("systemctl is-active --quiet docker")?;
        if !out.success() {
            bail!("docker service not active");
        }
        Ok(())
    }
}

struct DevCertbot;

impl Step for DevCertbot {
    fn id(&self) -> String {
        CERTBOT.to_string()
    }
    fn phase(&self) -> &'static str {
        "dev-setup"
    }
    fn target(&self) -> Target {
        dev_target()
    }
    fn depends_on(&self) -> Vec<String> {
        vec![PACKAGES.to_string()]
    }
    fn description(&self) -> String {
        "Install certbot in the dev container".to_string()
    }

    fn check(&self, ctx: &StepContext) -> Result<CheckOutcome> {
        let out = ctx.run("dpkg -s certbot 2> /dev/null | grep -q 'ok installed'")?;
        Ok(if out.success() {
            CheckOutcome::AlreadyApplied
        } else {
            CheckOutcome::NotApplied
        })
    }

    fn action(&self, ctx: &StepContext) -> Result<()> {
        ctx.run_checked("apt-get install -y certbot")?;
        Ok(())
    }
}

const BASHRC_BLOCK: &str = r#"
# vibehost dev environment

# Aliases
alias ll='ls -la'
alias la='ls -A'
alias l='ls -CF'
alias ..='cd ..'
alias ...='cd ../..'

# Git aliases
alias gs='git status'
alias ga='git add'
alias gc='git commit'
alias gp='git push'
alias gl='git log --oneline -10'
alias gd='git diff'

# Python aliases
alias py='python'
alias pip='uv pip'
alias venv='python -m venv'

# Docker aliases
alias d='docker'
alias dc='docker compose'
alias dps='docker ps'

# Useful environment
export EDITOR=vim
export VISUAL=vim
export HISTSIZE=10000
export HISTFILESIZE=20000

# Path additions
export PATH="/root/.local/bin:$PATH"

# Prompt with git branch
parse_git_branch() {
    git branch 2> /dev/null | sed -e '/^[^*]/d' -e 's/* \(.*\)/ (\1)/'
}
export PS1='\[\033[01;32m\]\u@dev\[\033[00m\]:\[\033[01;34m\]\w\[\033[33m\]$(parse_git_branch)\[\033[00m\]\$ '
"#;

struct DevShell;

impl Step for DevShell {
    fn id(&self) -> String {
        SHELL.to_string()
    }
    fn phase(&self) -> &'static str {
        "dev-setup"
    }
    fn target(&self) -> Target {
        dev_target()
    }
    fn depends_on(&self) -> Vec<String> {
        vec![PACKAGES.to_string()]
    }
    fn description(&self) -> String {
        "Configure the root shell and git defaults in dev".to_string()
    }

    fn check(&self, ctx: &StepContext) -> Result<CheckOutcome> {
        let out = ctx.run(&format!("grep -qF '{BASHRC_MARKER}' /root/.bashrc"))?;
        Ok(if out.success() {
            CheckOutcome::AlreadyApplied
        } else {
            CheckOutcome::NotApplied
        })
    }

    fn action(&self, ctx: &StepContext) -> Result<()> {
        ctx.run_checked(&format!(
            "cat >> /root/.bashrc << 'VIBEHOST_BASHRC'\n{BASHRC_BLOCK}\nVIBEHOST_BASHRC"
        ))?;
        ctx.run_checked("git config --global init.defaultBranch main")?;
        ctx.run_checked("git config --global pull.rebase false")?;
        Ok(())
    }

    fn verify(&self, ctx: &StepContext) -> Result<()> {
        let out = ctx.run(&format!("grep -qF '{BASHRC_MARKER}' /root/.bashrc"))?;
        if !out.success() {
            bail!("bashrc block missing after append");
        }
        Ok(())
    }
}

const SETUP_USER_SCRIPT: &str = r#"#!/bin/bash
# Create a new user with passwordless sudo access
# Usage: ./setup-user.sh <username>

set -e

if [ -z "$1" ]; then
    echo "Usage: $0 <username>"
    exit 1
fi

USERNAME="$1"

# Create user with home directory and bash shell
useradd -m -s /bin/bash "$USERNAME"

# Add to sudo group
usermod -aG sudo "$USERNAME"

# Configure passwordless sudo
echo "$USERNAME ALL=(ALL) NOPASSWD:ALL" > /etc/sudoers.d/"$USERNAME"
chmod 440 /etc/sudoers.d/"$USERNAME"

# Copy SSH authorized_keys from root if they exist
if [ -f /root/.ssh/authorized_keys ]; then
    mkdir -p /home/"$USERNAME"/.ssh
    cp /root/.ssh/authorized_keys /home/"$USERNAME"/.ssh/
    chown -R "$USERNAME":"$USERNAME" /home/"$USERNAME"/.ssh
    chmod 700 /home/"$USERNAME"/.ssh
    chmod 600 /home/"$USERNAME"/.ssh/authorized_keys
fi

echo "User '$USERNAME' created with passwordless sudo access"
echo "SSH keys copied from root (if present)"
"#;

const SETUP_CLAUDE_CODE_SCRIPT: &str = r#"#!/bin/bash
# Install Claude Code CLI for the current user
# IMPORTANT: Run this as your user, NOT as root
# Usage: setup-claude-code

set -e

if [ "$(id -u)" = "0" ]; then
    echo "ERROR: Do not run this script as root!"
    echo "Run as your regular user: setup-claude-code"
    exit 1
fi

echo "Installing Claude Code CLI for user: $USER"

# Configure npm to use user-local directory (avoids needing root)
mkdir -p ~/.npm-global
npm config set prefix ~/.npm-global

# Add to PATH if not already there
if ! grep -q 'npm-global/bin' ~/.bashrc 2>/dev/null; then
    echo 'export PATH=~/.npm-global/bin:$PATH' >> ~/.bashrc
fi
export PATH=~/.npm-global/bin:$PATH

# Install Claude Code
npm install -g @anthropic-ai/claude-code

echo ""
echo "Claude Code installed successfully!"
echo "Location: $(which claude)"
echo "Version: $(claude --version)"
echo ""
echo "Run 'source ~/.bashrc' or start a new shell, then:"
echo "  claude login    # to authenticate"
echo "  claude          # to start"
"#;

struct DevScripts;

impl Step for DevScripts {
    fn id(&self) -> String {
        SCRIPTS.to_string()
    }
    fn phase(&self) -> &'static str {
        "dev-setup"
    }
    fn target(&self) -> Target {
        dev_target()
    }
    fn depends_on(&self) -> Vec<String> {
        vec![PACKAGES.to_string()]
    }
    fn description(&self) -> String {
        "Install bootstrap scripts in the dev container".to_string()
    }

    fn check(&self, ctx: &StepContext) -> Result<CheckOutcome> {
        let out = ctx.run(
            "test -x /root/setup-user.sh -a -x /usr/local/bin/setup-claude-code",
        )?;
        Ok(if out.success() {
            CheckOutcome::AlreadyApplied
        } else {
            CheckOutcome::NotApplied
        })
    }

    fn action(&self, ctx: &StepContext) -> Result<()> {
        ctx.upload(SETUP_USER_SCRIPT, "/root/setup-user.sh", "755")?;
        // Lives on the global PATH so regular users can run it
        ctx.upload(
            SETUP_CLAUDE_CODE_SCRIPT,
            "/usr/local/bin/setup-claude-code",
            "755",
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DevSetupConfig;

    fn dev_config(yaml: &str) -> DevSetupConfig {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn extras_toggle_their_steps() {
        let mut config = crate::steps::test_config();
        config.dev_setup = dev_config(
            "extras:\n  docker: false\n  certbot: false\n  claude_code: true\n",
        );
        let ids: Vec<String> = steps(&config).iter().map(|s| s.id()).collect();
        assert!(!ids.contains(&DOCKER.to_string()));
        assert!(!ids.contains(&CERTBOT.to_string()));
        assert!(ids.contains(&SCRIPTS.to_string()));
    }

    #[test]
    fn default_extras_install_docker_and_certbot() {
        let config = crate::steps::test_config();
        let ids: Vec<String> = steps(&config).iter().map(|s| s.id()).collect();
        assert!(ids.contains(&DOCKER.to_string()));
        assert!(ids.contains(&CERTBOT.to_string()));
    }

    #[test]
    fn bashrc_block_carries_the_idempotency_marker() {
        assert!(BASHRC_BLOCK.contains(BASHRC_MARKER));
    }

    #[test]
    fn every_dev_step_targets_the_dev_container() {
        let config = crate::steps::test_config();
        for step in steps(&config) {
            assert_eq!(step.target(), Target::Container("dev".to_string()), "{}", step.id());
        }
    }
}
