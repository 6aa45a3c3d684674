/// 脚本相关的常量定义
///
/// 统一管理脚本文档与运行时约定的字段名

/// Script document field names
pub mod document {
    pub const ID: &str = "@id";
    pub const DO: &str = "do";
    pub const ELSE: &str = "else";

    /// Sequence every run starts from.
    pub const MAIN_SEQUENCE: &str = "main";
}

/// Node `args` fields interpreted by the engine
pub mod args {
    pub const THREAD_ID: &str = "threadId";
    pub const PATH: &str = "path";
    pub const ASYNC: &str = "async";
    pub const SET: &str = "set";
    pub const SET_GLOBAL: &str = "setGlobal";
    pub const ITERATE_OVER: &str = "iterateOver";
    pub const PARALLEL: &str = "parallel";
    pub const SET_ELEMENT: &str = "setElement";
}

/// Built-in action names
pub mod builtin {
    pub const RUN: &str = "run";
    pub const EXIT: &str = "exit";
    pub const FOR_EACH: &str = "forEach";
    pub const MENU: &str = "menu";
    pub const PARSE_JSON: &str = "parseJson";
    pub const LOG: &str = "log";
    pub const REST: &str = "rest";
}

/// Runtime naming conventions
pub mod runtime {
    pub const MAIN_THREAD_ID: &str = "main";
    /// Separator between a thread-id prefix and its counter suffix.
    pub const THREAD_SUFFIX_SEPARATOR: char = '#';
    /// Ends every path segment; thread ids must not contain it.
    pub const SCOPE_SEPARATOR: char = '-';
    /// Hidden local that points an iteration scope at the list collecting
    /// `set` results of its forEach.
    pub const COLLECT_FIELD: &str = "_collect";
    pub const EXCEPTION: &str = "exception";
}
