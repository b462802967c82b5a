use std::fmt;

/// 宿主循环中的调度阶段。
///
/// 每个宿主 tick 内 update 总是先于 late-update；fixed-update 以独立节奏运行，
/// 一个宿主 tick 内可能执行零次或多次。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Update,
    LateUpdate,
    FixedUpdate,
}

impl Phase {
    pub const ALL: [Phase; 3] = [Phase::Update, Phase::LateUpdate, Phase::FixedUpdate];

    pub fn label(self) -> &'static str {
        match self {
            Phase::Update => "update",
            Phase::LateUpdate => "late_update",
            Phase::FixedUpdate => "fixed_update",
        }
    }

    pub(crate) fn index(self) -> usize {
        match self {
            Phase::Update => 0,
            Phase::LateUpdate => 1,
            Phase::FixedUpdate => 2,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}
