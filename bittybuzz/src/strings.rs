pub type StringId = u16;

/// Names the runtime itself refers to. Their ids are fixed, image strings are
/// numbered after them.
#[repr(u16)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Builtin {
    Id = 0,
    Neighbors,
    Stigmergy,
    Swarm,
    Log,
    Init,
    Step,
    Broadcast,
    Listen,
    Ignore,
    Get,
    Foreach,
    Map,
    Reduce,
    Filter,
    Count,
    Kin,
    Nonkin,
    Distance,
    Azimuth,
    Elevation,
    Create,
    Put,
    Size,
    Onconflict,
    Onconflictlost,
    Robot,
    Data,
    Timestamp,
    Join,
    Leave,
    In,
    Select,
    Exec,
}

pub const BUILTIN_NAMES: &[&str] = &[
    "id",
    "neighbors",
    "stigmergy",
    "swarm",
    "log",
    "init",
    "step",
    "broadcast",
    "listen",
    "ignore",
    "get",
    "foreach",
    "map",
    "reduce",
    "filter",
    "count",
    "kin",
    "nonkin",
    "distance",
    "azimuth",
    "elevation",
    "create",
    "put",
    "size",
    "onconflict",
    "onconflictlost",
    "robot",
    "data",
    "timestamp",
    "join",
    "leave",
    "in",
    "select",
    "exec",
];

impl Builtin {
    #[inline]
    pub const fn id(self) -> StringId {
        self as StringId
    }

    pub fn name(self) -> &'static str {
        BUILTIN_NAMES[self as usize]
    }
}

#[derive(Debug, Clone)]
pub struct StringTable {
    strings: Vec<Box<str>>,
}

impl Default for StringTable {
    fn default() -> Self {
        Self::new()
    }
}

impl StringTable {
    pub fn new() -> Self {
        Self {
            strings: BUILTIN_NAMES.iter().map(|&name| name.into()).collect(),
        }
    }

    /// Replace image strings, keeping the builtins. Returns the id of the
    /// first image string.
    pub fn load_image_strings<I, S>(&mut self, strings: I) -> StringId
    where
        I: IntoIterator<Item = S>,
        S: Into<Box<str>>,
    {
        self.strings.truncate(BUILTIN_NAMES.len());
        self.strings.extend(strings.into_iter().map(Into::into));
        BUILTIN_NAMES.len() as StringId
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.strings.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.strings.is_empty()
    }

    #[inline]
    pub fn contains(&self, id: StringId) -> bool {
        (id as usize) < self.strings.len()
    }

    pub fn get(&self, id: StringId) -> Option<&str> {
        self.strings.get(id as usize).map(|s| &**s)
    }

    /// First id naming `value`. Builtins win over image duplicates.
    pub fn find(&self, value: &str) -> Option<StringId> {
        self.strings
            .iter()
            .position(|s| &**s == value)
            .map(|pos| pos as StringId)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_ids_match_names() {
        assert_eq!(BUILTIN_NAMES.len(), Builtin::Exec as usize + 1);
        assert_eq!(Builtin::Id.name(), "id");
        assert_eq!(Builtin::Onconflictlost.name(), "onconflictlost");
        assert_eq!(Builtin::Exec.name(), "exec");
    }

    #[test]
    fn image_strings_follow_builtins() {
        let mut table = StringTable::new();
        let first = table.load_image_strings(["x", "y"]);
        assert_eq!(first as usize, BUILTIN_NAMES.len());
        assert_eq!(table.get(first + 1), Some("y"));
        assert!(!table.contains(first + 2));
        assert_eq!(table.find("step"), Some(Builtin::Step.id()));
    }

    #[test]
    fn reloading_replaces_image_strings() {
        let mut table = StringTable::new();
        table.load_image_strings(["a", "b", "c"]);
        table.load_image_strings(["z"]);
        assert_eq!(table.len(), BUILTIN_NAMES.len() + 1);
        assert_eq!(table.find("a"), None);
    }
}
