//! Competition settings of a test rollout.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::ToolkitError;

/// Port the team server listens on, inside and outside the container.
pub const PORT: u16 = 12343;

/// Name the submission team plays under.
pub const TEAM_NAME: &str = "my-submission";

/// Override of the framework's default competition settings.
///
/// Built fresh for each rollout. Builders consume `self`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompetitionConfig {
    map_path: String,
    population: usize,
    episodes: u32,
    render: bool,
}

impl CompetitionConfig {
    /// Maps the evaluation runs on.
    pub const EVALUATION_MAPS: &'static str = "maps/medium/evaluation";
    /// Teams per episode: the submission plus scripted opponents.
    pub const POPULATION: usize = 16;

    /// Evaluation maps, full population, one episode, no rendering.
    pub fn new() -> Self {
        Self {
            map_path: Self::EVALUATION_MAPS.to_string(),
            population: Self::POPULATION,
            episodes: 1,
            render: false,
        }
    }

    /// Number of episodes to roll out. At least one.
    pub fn with_episodes(mut self, episodes: u32) -> Self {
        self.episodes = episodes.max(1);
        self
    }

    /// Render the episodes.
    pub fn with_render(mut self, render: bool) -> Self {
        self.render = render;
        self
    }

    /// Maps directory, relative to the framework resources.
    pub fn map_path(&self) -> &str {
        &self.map_path
    }

    /// Teams per episode.
    pub fn population(&self) -> usize {
        self.population
    }

    /// Scripted random opponents added next to the submission team.
    pub fn opponents(&self) -> usize {
        self.population.saturating_sub(1)
    }

    /// Episodes to roll out.
    pub fn episodes(&self) -> u32 {
        self.episodes
    }

    /// Render the episodes.
    pub fn render(&self) -> bool {
        self.render
    }
}

impl Default for CompetitionConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Where the rollout gets the submission team from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TeamSource {
    /// Load the submission inside the rollout process.
    Submission(PathBuf),
    /// Proxy to a team server already listening on `host:port`.
    Remote {
        /// Host name or address of the team server.
        host: String,
        /// Port of the team server.
        port: u16,
    },
}

impl TeamSource {
    /// The submission, loaded in process.
    pub fn submission(path: &Path) -> Self {
        TeamSource::Submission(path.to_path_buf())
    }

    /// The team server launched on this machine.
    pub fn local_server() -> Self {
        TeamSource::Remote {
            host: "127.0.0.1".to_string(),
            port: PORT,
        }
    }
}

/// How the team server is started for a test.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartBy {
    /// In a docker container built from the submission image.
    Docker,
    /// In a local child process.
    Process,
}

impl FromStr for StartBy {
    type Err = ToolkitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "docker" => Ok(StartBy::Docker),
            "process" => Ok(StartBy::Process),
            other => Err(ToolkitError::InvalidStartBy(other.to_string())),
        }
    }
}

impl fmt::Display for StartBy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StartBy::Docker => write!(f, "docker"),
            StartBy::Process => write!(f, "process"),
        }
    }
}
