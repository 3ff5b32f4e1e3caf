//! Pipeline and module state management

use std::time::Instant;

/// Lifecycle of a single module
///
/// ```text
/// Uninitialized -init-> Initialized -start-> Running <-pause/resume-> Paused
/// Initialized | Running | Paused -stop-> Stopped
/// any -failure-> Error   (terminal until destroyed)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleStatus {
    Uninitialized,
    Initialized,
    Running {
        /// When the module started (or last resumed)
        started_at: Instant,
    },
    Paused {
        paused_at: Instant,
    },
    Stopped,
    Error,
}

impl ModuleStatus {
    /// Check if this state transition is valid
    pub fn can_transition_to(&self, target: &ModuleStatus) -> bool {
        use ModuleStatus::*;

        match (self, target) {
            // A failed module must be destroyed, never restarted
            (Error, _) => false,
            (_, Error) => true,

            (Uninitialized, Initialized) => true,
            (Initialized, Running { .. }) => true,
            (Running { .. }, Paused { .. }) => true,
            (Paused { .. }, Running { .. }) => true,
            (Initialized | Running { .. } | Paused { .. }, Stopped) => true,

            (Stopped, _) => false,
            _ => false,
        }
    }

    /// Get a human-readable description of this state
    pub fn description(&self) -> &'static str {
        match self {
            ModuleStatus::Uninitialized => "Uninitialized",
            ModuleStatus::Initialized => "Initialized",
            ModuleStatus::Running { .. } => "Running",
            ModuleStatus::Paused { .. } => "Paused",
            ModuleStatus::Stopped => "Stopped",
            ModuleStatus::Error => "Error",
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self, ModuleStatus::Running { .. })
    }

    pub fn is_paused(&self) -> bool {
        matches!(self, ModuleStatus::Paused { .. })
    }

    /// Running or paused: a worker exists
    pub fn is_active(&self) -> bool {
        matches!(self, ModuleStatus::Running { .. } | ModuleStatus::Paused { .. })
    }

    pub fn is_error(&self) -> bool {
        matches!(self, ModuleStatus::Error)
    }
}

impl std::fmt::Display for ModuleStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.description())
    }
}

/// Lifecycle of the pipeline as a whole
///
/// ```text
/// Idle -init-> Initializing -start-> Running <-pause/resume-> Paused
/// Idle | Initializing | Running | Paused -stop-> Stopping -> Stopped
/// ```
///
/// `Initializing` covers the time between a successful `init` and `start`:
/// every stage is initialized and wired but no worker runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Initializing,
    Running {
        /// When the pipeline started (or last resumed)
        started_at: Instant,
    },
    Paused {
        paused_at: Instant,
    },
    /// Stages are being stopped consumer-first
    Stopping,
    /// Terminal; a stopped pipeline is never restarted
    Stopped,
}

impl PipelineState {
    /// Check if this state transition is valid
    pub fn can_transition_to(&self, target: &PipelineState) -> bool {
        use PipelineState::*;

        match (self, target) {
            (Idle, Initializing) => true,
            (Initializing, Running { .. }) => true,
            (Running { .. }, Paused { .. }) => true,
            (Paused { .. }, Running { .. }) => true,
            (Idle | Initializing | Running { .. } | Paused { .. }, Stopping) => true,
            (Stopping, Stopped) => true,
            _ => false,
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            PipelineState::Idle => "Idle",
            PipelineState::Initializing => "Initializing",
            PipelineState::Running { .. } => "Running",
            PipelineState::Paused { .. } => "Paused",
            PipelineState::Stopping => "Stopping",
            PipelineState::Stopped => "Stopped",
        }
    }

    /// Running or paused: stage workers exist
    pub fn is_active(&self) -> bool {
        matches!(self, PipelineState::Running { .. } | PipelineState::Paused { .. })
    }

    pub fn is_running(&self) -> bool {
        matches!(self, PipelineState::Running { .. })
    }

    pub fn is_paused(&self) -> bool {
        matches!(self, PipelineState::Paused { .. })
    }
}

impl std::fmt::Display for PipelineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.description())
    }
}
