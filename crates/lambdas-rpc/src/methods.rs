//! Static method tables for each side of the channel.

/// A closed set of callable methods. Unknown names never map to a method.
pub trait MethodSet: Copy + Send + Sync + 'static {
    const ALL: &'static [Self];

    fn name(self) -> &'static str;

    fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|m| m.name() == name)
    }
}

/// Methods the host serves; called by apps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HostMethod {
    Register,
}

impl MethodSet for HostMethod {
    const ALL: &'static [Self] = &[HostMethod::Register];

    fn name(self) -> &'static str {
        match self {
            HostMethod::Register => "register",
        }
    }
}

/// Methods a sandboxed app serves; called by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AppMethod {
    PushPayload,
    SetSettings,
}

impl MethodSet for AppMethod {
    const ALL: &'static [Self] = &[AppMethod::PushPayload, AppMethod::SetSettings];

    fn name(self) -> &'static str {
        match self {
            AppMethod::PushPayload => "pushPayload",
            AppMethod::SetSettings => "setSettings",
        }
    }
}
