use crate::config::{parse_build_arg, BuildConfig, CommandExitPolicy, FailurePolicy};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Multi-step container image builder
#[derive(Parser, Debug)]
#[command(
    name = "stepwise",
    about = "Multi-step container image builder with dependency-level scheduling",
    version,
    author,
    long_about = "stepwise builds the steps of a build manifest against a Docker daemon. \
                  Steps whose build files name another step as their base image wait for \
                  it; independent steps build concurrently. Steps can clean up and squash \
                  their image, copy artifacts to the host and run a command."
)]
pub struct CliArgs {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(long, global = true, value_name = "LEVEL", help = "Set logging level")]
    pub log_level: Option<String>,

    #[arg(short = 'v', long, global = true, help = "Enable debug output")]
    pub verbose: bool,

    #[arg(
        short = 'q',
        long,
        global = true,
        conflicts_with = "verbose",
        help = "Quiet mode - suppress non-error output"
    )]
    pub quiet: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    #[command(
        about = "Build every step of a manifest",
        long_about = "Builds all steps level by level and prints a per-step report.\n\n\
                      Examples:\n  \
                      stepwise build\n  \
                      stepwise build -f build.yml --unique-id ci-42\n  \
                      stepwise build --build-arg VERSION=1.2 --no-squash --keep-steps"
    )]
    Build(BuildArgs),

    #[command(
        about = "Print the build levels of a manifest",
        long_about = "Resolves step dependencies and prints the levels steps would run in, \
                      without contacting the daemon.\n\n\
                      Examples:\n  \
                      stepwise levels\n  \
                      stepwise levels -f build.yml"
    )]
    Levels(LevelsArgs),
}

#[derive(Parser, Debug, Clone)]
pub struct ManifestArgs {
    #[arg(
        short = 'f',
        long = "file",
        value_name = "FILE",
        help = "Build manifest, relative to the working directory (default: build.yml)"
    )]
    pub manifest: Option<PathBuf>,

    #[arg(
        short = 'w',
        long,
        value_name = "DIR",
        help = "Working directory holding the manifest and build files"
    )]
    pub workdir: Option<PathBuf>,
}

impl ManifestArgs {
    pub fn apply(&self, config: &mut BuildConfig) {
        if let Some(workdir) = &self.workdir {
            config.workdir = workdir.clone();
        }
        if let Some(manifest) = &self.manifest {
            config.manifest_path = manifest.clone();
        }
    }
}

#[derive(Parser, Debug, Clone)]
pub struct LevelsArgs {
    #[command(flatten)]
    pub manifest: ManifestArgs,
}

#[derive(Parser, Debug, Clone)]
pub struct BuildArgs {
    #[command(flatten)]
    pub manifest: ManifestArgs,

    #[arg(
        short = 'u',
        long,
        value_name = "ID",
        help = "Token mixed into image names to keep concurrent runs apart"
    )]
    pub unique_id: Option<String>,

    #[arg(
        long = "build-arg",
        value_name = "KEY=VALUE",
        value_parser = parse_build_arg_value,
        help = "Build argument passed to every step (repeatable)"
    )]
    pub build_args: Vec<(String, String)>,

    #[arg(long, help = "Keep every step image, not just the final one")]
    pub keep_steps: bool,

    #[arg(long, help = "Remove artifact directories created by this run when it ends")]
    pub remove_artifacts: bool,

    #[arg(long, help = "Skip cleanup commands and squashing")]
    pub no_squash: bool,

    #[arg(long, help = "Build without the daemon's layer cache")]
    pub no_cache: bool,

    #[arg(long, help = "Do not stream build output")]
    pub suppress_output: bool,

    #[arg(long, help = "Force removal of step images at the end of the run")]
    pub force_rm: bool,

    #[arg(long, help = "Keep untagged parents when removing step images")]
    pub no_prune: bool,

    #[arg(long, help = "Keep intermediate build containers after a successful build")]
    pub keep_tmp_containers: bool,

    #[arg(long, help = "Always remove intermediate build containers, even after a failed build")]
    pub force_rm_tmp_containers: bool,

    #[arg(long, value_enum, help = "What to do with later levels after a step fails")]
    pub on_failure: Option<FailurePolicyArg>,

    #[arg(long, value_enum, help = "How a non-zero exit of a step command is treated")]
    pub command_exit: Option<CommandExitPolicyArg>,

    #[arg(long, help = "Stop sibling steps at their next phase when one step fails")]
    pub cancel_siblings: bool,
}

impl BuildArgs {
    /// Layers the flags over an environment-derived configuration.
    pub fn apply(&self, config: &mut BuildConfig) {
        self.manifest.apply(config);
        if let Some(id) = &self.unique_id {
            config.unique_id = id.clone();
        }
        config.build_args.extend(self.build_args.iter().cloned());
        config.keep_steps |= self.keep_steps;
        if self.remove_artifacts {
            config.keep_artifacts = false;
        }
        config.no_squash |= self.no_squash;
        config.no_cache |= self.no_cache;
        config.suppress_output |= self.suppress_output;
        config.force_rm_images |= self.force_rm;
        config.no_prune_rm_images |= self.no_prune;
        if self.keep_tmp_containers {
            config.rm_tmp_containers = false;
        }
        config.force_rm_tmp_container |= self.force_rm_tmp_containers;
        if let Some(policy) = self.on_failure {
            config.failure_policy = policy.into();
        }
        if let Some(policy) = self.command_exit {
            config.command_exit_policy = policy.into();
        }
        config.cancel_siblings_on_failure |= self.cancel_siblings;
    }
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicyArg {
    Abort,
    Continue,
}

impl From<FailurePolicyArg> for FailurePolicy {
    fn from(arg: FailurePolicyArg) -> Self {
        match arg {
            FailurePolicyArg::Abort => FailurePolicy::AbortRun,
            FailurePolicyArg::Continue => FailurePolicy::ContinueIndependent,
        }
    }
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandExitPolicyArg {
    Log,
    Fail,
}

impl From<CommandExitPolicyArg> for CommandExitPolicy {
    fn from(arg: CommandExitPolicyArg) -> Self {
        match arg {
            CommandExitPolicyArg::Log => CommandExitPolicy::Log,
            CommandExitPolicyArg::Fail => CommandExitPolicy::Fail,
        }
    }
}

fn parse_build_arg_value(s: &str) -> Result<(String, String), String> {
    parse_build_arg(s).map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_args_verify() {
        CliArgs::command().debug_assert();
    }

    #[test]
    fn test_default_build_args() {
        let args = CliArgs::parse_from(["stepwise", "build"]);
        match args.command {
            Commands::Build(build) => {
                assert!(build.manifest.manifest.is_none());
                assert!(build.unique_id.is_none());
                assert!(build.build_args.is_empty());
                assert!(!build.keep_steps);
                assert!(build.on_failure.is_none());
            }
            _ => panic!("Expected Build command"),
        }
    }

    #[test]
    fn test_build_with_options() {
        let args = CliArgs::parse_from([
            "stepwise",
            "build",
            "-f",
            "ci.yml",
            "--unique-id",
            "ci-42",
            "--build-arg",
            "VERSION=1.2",
            "--build-arg",
            "EMPTY=",
            "--no-squash",
            "--on-failure",
            "continue",
            "--command-exit",
            "fail",
        ]);

        match args.command {
            Commands::Build(build) => {
                assert_eq!(build.manifest.manifest, Some(PathBuf::from("ci.yml")));
                assert_eq!(build.unique_id, Some("ci-42".to_string()));
                assert_eq!(
                    build.build_args,
                    vec![
                        ("VERSION".to_string(), "1.2".to_string()),
                        ("EMPTY".to_string(), String::new())
                    ]
                );
                assert!(build.no_squash);
                assert_eq!(build.on_failure, Some(FailurePolicyArg::Continue));
                assert_eq!(build.command_exit, Some(CommandExitPolicyArg::Fail));
            }
            _ => panic!("Expected Build command"),
        }
    }

    #[test]
    fn test_invalid_build_arg_rejected() {
        let result = CliArgs::try_parse_from(["stepwise", "build", "--build-arg", "NOVALUE"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_apply_overrides_config() {
        let args = CliArgs::parse_from([
            "stepwise",
            "build",
            "-w",
            "/tmp/work",
            "--remove-artifacts",
            "--cancel-siblings",
            "--on-failure",
            "continue",
            "--no-prune",
            "--keep-tmp-containers",
        ]);
        let Commands::Build(build) = args.command else {
            panic!("Expected Build command");
        };

        let mut config = BuildConfig {
            keep_artifacts: true,
            ..BuildConfig::default()
        };
        build.apply(&mut config);

        assert_eq!(config.workdir, PathBuf::from("/tmp/work"));
        assert!(!config.keep_artifacts);
        assert!(config.cancel_siblings_on_failure);
        assert_eq!(config.failure_policy, FailurePolicy::ContinueIndependent);
        assert!(config.no_prune_rm_images);
        assert!(!config.rm_tmp_containers);
        assert!(!config.force_rm_tmp_container);
    }

    #[test]
    fn test_levels_command() {
        let args = CliArgs::parse_from(["stepwise", "levels", "--file", "other.yml"]);
        match args.command {
            Commands::Levels(levels) => {
                assert_eq!(levels.manifest.manifest, Some(PathBuf::from("other.yml")));
            }
            _ => panic!("Expected Levels command"),
        }
    }

    #[test]
    fn test_global_flags() {
        let args = CliArgs::parse_from(["stepwise", "-v", "build"]);
        assert!(args.verbose);
        assert!(!args.quiet);

        let args = CliArgs::parse_from(["stepwise", "levels", "--log-level", "debug"]);
        assert_eq!(args.log_level, Some("debug".to_string()));
    }

    #[test]
    fn test_verbose_conflicts_with_quiet() {
        assert!(CliArgs::try_parse_from(["stepwise", "-v", "-q", "build"]).is_err());
    }
}
