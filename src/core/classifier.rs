//! 错误分类与循环检测
//!
//! 把工具错误映射为 类别 / 严重度 / 有序恢复策略，并保留最近 50 条分类（按任务清空）用于循环检测：
//! 最近 5 条中同类 >= 3 条即视为在原地打转，已给过的策略会被压制，改为提示换思路或询问用户。

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::core::ToolError;

/// 分类历史上限
const HISTORY_LIMIT: usize = 50;
/// 循环检测窗口
const LOOP_WINDOW: usize = 5;
/// 窗口内同类错误达到该数即判定为循环
const LOOP_THRESHOLD: usize = 3;

/// 错误类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    MissingResource,
    SyntaxError,
    PropertyError,
    AlreadyExists,
    AmbiguousMatch,
    SearchFailed,
    InvalidClass,
    ParentError,
    RateLimited,
    TypeError,
    UserDenied,
    Unknown,
}

/// 严重度
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Low,
    Medium,
    High,
}

/// 恢复策略（按推荐顺序排列）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStrategy {
    RereadState,
    SearchAlternatives,
    CheckPropertyNames,
    UseExisting,
    ChooseDifferentName,
    NarrowSelector,
    VerifySyntax,
    CheckClassName,
    CreateParentFirst,
    WaitAndRetry,
    ConvertValueType,
    ChangeApproach,
    AskUser,
}

impl RecoveryStrategy {
    /// 给模型看的建议文本
    pub fn suggestion(&self) -> &'static str {
        match self {
            Self::RereadState => {
                "Re-read the target before modifying it; the state you remember may be stale."
            }
            Self::SearchAlternatives => "Search for the resource under a different path or name.",
            Self::CheckPropertyNames => {
                "Check the exact property name and whether this class supports it."
            }
            Self::UseExisting => {
                "The object already exists; reuse it instead of creating it again."
            }
            Self::ChooseDifferentName => "Pick a different, unused name.",
            Self::NarrowSelector => {
                "Make the selector or search text more specific so it matches exactly once."
            }
            Self::VerifySyntax => {
                "Fix the syntax error and check the whole snippet before retrying."
            }
            Self::CheckClassName => "Use a valid class name.",
            Self::CreateParentFirst => "Create or locate the parent object first.",
            Self::WaitAndRetry => "The service is rate limited; wait briefly before retrying.",
            Self::ConvertValueType => "Convert the value to the type the property expects.",
            Self::ChangeApproach => "Stop repeating this attempt and try a different approach.",
            Self::AskUser => "Ask the user how to proceed.",
        }
    }
}

impl ErrorCategory {
    pub fn severity(&self) -> Severity {
        match self {
            Self::UserDenied => Severity::Info,
            Self::AlreadyExists | Self::RateLimited => Severity::Low,
            Self::SyntaxError => Severity::High,
            _ => Severity::Medium,
        }
    }

    pub fn strategies(&self) -> Vec<RecoveryStrategy> {
        use RecoveryStrategy as S;
        match self {
            Self::MissingResource => vec![S::RereadState, S::SearchAlternatives, S::AskUser],
            Self::SyntaxError => vec![S::VerifySyntax, S::RereadState],
            Self::PropertyError => vec![S::CheckPropertyNames, S::RereadState],
            Self::AlreadyExists => vec![S::UseExisting, S::ChooseDifferentName],
            Self::AmbiguousMatch => vec![S::NarrowSelector, S::RereadState],
            Self::SearchFailed => vec![S::RereadState, S::NarrowSelector],
            Self::InvalidClass => vec![S::CheckClassName, S::AskUser],
            Self::ParentError => vec![S::CreateParentFirst, S::RereadState],
            Self::RateLimited => vec![S::WaitAndRetry],
            Self::TypeError => vec![S::ConvertValueType, S::CheckPropertyNames],
            Self::UserDenied => vec![S::AskUser],
            Self::Unknown => vec![S::ChangeApproach, S::AskUser],
        }
    }
}

/// 一次分类结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorClassification {
    pub category: ErrorCategory,
    pub severity: Severity,
    pub recovery_strategies: Vec<RecoveryStrategy>,
    pub tool_name: String,
    pub timestamp: DateTime<Utc>,
    /// 是否触发了循环升级
    pub escalated: bool,
}

impl ErrorClassification {
    /// 排名第一的建议
    pub fn top_suggestion(&self) -> Option<&'static str> {
        self.recovery_strategies.first().map(|s| s.suggestion())
    }
}

/// 文本模式表：顺序即优先级（SearchFailed 必须在 MissingResource 之前）
fn patterns() -> &'static [(Regex, ErrorCategory)] {
    static PATTERNS: OnceLock<Vec<(Regex, ErrorCategory)>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        let table: [(&str, ErrorCategory); 11] = [
            (
                r"(?i)search (content|text|string)? ?not found|could not find search",
                ErrorCategory::SearchFailed,
            ),
            (r"(?i)rate.?limit|too many requests|\b429\b", ErrorCategory::RateLimited),
            (r"(?i)denied|rejected by (the )?user", ErrorCategory::UserDenied),
            (r"(?i)already exists|duplicate", ErrorCategory::AlreadyExists),
            (r"(?i)ambiguous|multiple matches|matched \d+ times", ErrorCategory::AmbiguousMatch),
            (r"(?i)(invalid|unknown) class|not a valid class", ErrorCategory::InvalidClass),
            (r"(?i)parent", ErrorCategory::ParentError),
            (r"(?i)syntax|unexpected (token|symbol)|parse error", ErrorCategory::SyntaxError),
            (
                r"(?i)not a valid member|(unknown|invalid) property|property",
                ErrorCategory::PropertyError,
            ),
            (r"(?i)type mismatch|expected \w+, got|invalid type", ErrorCategory::TypeError),
            (r"(?i)not found|does not exist|no such|missing", ErrorCategory::MissingResource),
        ];
        table
            .into_iter()
            .filter_map(|(p, c)| Regex::new(p).ok().map(|r| (r, c)))
            .collect()
    })
}

/// 仅按文本匹配类别（用于不透明的外部错误）
pub fn categorize_message(message: &str) -> ErrorCategory {
    patterns()
        .iter()
        .find(|(re, _)| re.is_match(message))
        .map(|(_, c)| *c)
        .unwrap_or(ErrorCategory::Unknown)
}

/// 错误分类器：保留任务内的分类历史用于循环检测
#[derive(Debug, Default)]
pub struct ErrorClassifier {
    history: VecDeque<ErrorClassification>,
    /// 循环升级后被压制的 (类别, 策略)
    suppressed: HashMap<ErrorCategory, HashSet<RecoveryStrategy>>,
}

impl ErrorClassifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// 分类并记录；若检测到循环则压制已给过的策略并追加 ChangeApproach / AskUser
    pub fn classify(&mut self, tool_name: &str, error: &ToolError) -> ErrorClassification {
        let category = error
            .category
            .unwrap_or_else(|| categorize_message(&error.message));
        let mut classification = ErrorClassification {
            category,
            severity: category.severity(),
            recovery_strategies: category.strategies(),
            tool_name: tool_name.to_string(),
            timestamp: Utc::now(),
            escalated: false,
        };

        self.history.push_back(classification.clone());
        while self.history.len() > HISTORY_LIMIT {
            self.history.pop_front();
        }

        // 用户拒绝不是模型的错，不参与循环升级
        let looping = category != ErrorCategory::UserDenied && self.detect_loop() == Some(category);
        if looping {
            self.suppressed.entry(category).or_default().extend(
                category
                    .strategies()
                    .into_iter()
                    .filter(|s| !matches!(s, RecoveryStrategy::AskUser)),
            );
        }

        // 压制集在整个任务内生效，不随循环窗口滑出而恢复
        let remaining: Vec<RecoveryStrategy> = match self.suppressed.get(&category) {
            Some(suppressed) => category
                .strategies()
                .into_iter()
                .filter(|s| !suppressed.contains(s))
                .collect(),
            None => category.strategies(),
        };

        if looping {
            let mut strategies = vec![RecoveryStrategy::ChangeApproach, RecoveryStrategy::AskUser];
            let extras: Vec<RecoveryStrategy> = remaining
                .into_iter()
                .filter(|s| !strategies.contains(s))
                .collect();
            strategies.extend(extras);
            classification.recovery_strategies = strategies;
            classification.severity = Severity::High;
            classification.escalated = true;
            tracing::warn!(tool = tool_name, ?category, "repeating failure loop detected");
        } else if remaining.is_empty() {
            classification.recovery_strategies =
                vec![RecoveryStrategy::ChangeApproach, RecoveryStrategy::AskUser];
        } else {
            classification.recovery_strategies = remaining;
        }

        classification
    }

    /// 最近 LOOP_WINDOW 条中出现 >= LOOP_THRESHOLD 次的类别
    pub fn detect_loop(&self) -> Option<ErrorCategory> {
        let mut counts: HashMap<ErrorCategory, usize> = HashMap::new();
        for c in self.history.iter().rev().take(LOOP_WINDOW) {
            *counts.entry(c.category).or_default() += 1;
        }
        counts
            .into_iter()
            .filter(|(_, n)| *n >= LOOP_THRESHOLD)
            .max_by_key(|(_, n)| *n)
            .map(|(c, _)| c)
    }

    /// 生成回灌给模型的说明文字
    pub fn describe(&self, classification: &ErrorClassification) -> String {
        let mut text = String::new();
        if let Some(s) = classification.top_suggestion() {
            text.push_str(s);
        }
        if classification.escalated {
            text.push_str(
                " This kind of error keeps repeating: do not retry the same fix again. \
                 Change your approach or ask the user for guidance.",
            );
        }
        text
    }

    pub fn history(&self) -> impl Iterator<Item = &ErrorClassification> {
        self.history.iter()
    }

    /// 新任务开始：清空历史与压制集
    pub fn reset_for_task(&mut self) {
        self.history.clear();
        self.suppressed.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pattern_categories() {
        assert_eq!(categorize_message("search content not found"), ErrorCategory::SearchFailed);
        assert_eq!(
            categorize_message("Path not found: Workspace/Foo"),
            ErrorCategory::MissingResource
        );
        assert_eq!(categorize_message("Instance already exists"), ErrorCategory::AlreadyExists);
        assert_eq!(categorize_message("HTTP 429 Too Many Requests"), ErrorCategory::RateLimited);
        assert_eq!(categorize_message("Unknown class 'Partt'"), ErrorCategory::InvalidClass);
        assert_eq!(categorize_message("Syntax error near 'end'"), ErrorCategory::SyntaxError);
        assert_eq!(
            categorize_message("Colour is not a valid member of Part"),
            ErrorCategory::PropertyError
        );
        assert_eq!(categorize_message("something odd"), ErrorCategory::Unknown);
    }

    #[test]
    fn test_structured_category_wins() {
        let mut classifier = ErrorClassifier::new();
        let err = ToolError::new(ErrorCategory::ParentError, "whatever text");
        let c = classifier.classify("create_instance", &err);
        assert_eq!(c.category, ErrorCategory::ParentError);
        assert_eq!(c.recovery_strategies[0], RecoveryStrategy::CreateParentFirst);
        assert_eq!(c.severity, Severity::Medium);
    }

    #[test]
    fn test_loop_detection_escalates() {
        let mut classifier = ErrorClassifier::new();
        let err = ToolError::opaque("search content not found");
        let first = classifier.classify("edit_script", &err);
        assert!(!first.escalated);
        classifier.classify("edit_script", &err);
        let third = classifier.classify("edit_script", &err);
        assert!(third.escalated);
        assert_eq!(third.recovery_strategies[0], RecoveryStrategy::ChangeApproach);
        assert!(!third.recovery_strategies.contains(&RecoveryStrategy::RereadState));
        assert!(classifier.describe(&third).contains("Change your approach"));
        assert_eq!(classifier.detect_loop(), Some(ErrorCategory::SearchFailed));
    }

    #[test]
    fn test_loop_window_only_counts_recent() {
        let mut classifier = ErrorClassifier::new();
        let search = ToolError::opaque("search content not found");
        let other = ToolError::new(ErrorCategory::TypeError, "bad");
        classifier.classify("a", &search);
        classifier.classify("a", &search);
        for _ in 0..4 {
            classifier.classify("b", &other);
        }
        // 最近 5 条中 SearchFailed 只剩 1 条
        assert_eq!(classifier.detect_loop(), Some(ErrorCategory::TypeError));
    }

    #[test]
    fn test_history_bounded_and_task_scoped() {
        let mut classifier = ErrorClassifier::new();
        for i in 0..60 {
            let err = ToolError::new(ErrorCategory::AlreadyExists, format!("dup {i}"));
            classifier.classify("create_instance", &err);
        }
        assert_eq!(classifier.history().count(), 50);
        classifier.reset_for_task();
        assert_eq!(classifier.history().count(), 0);
        assert_eq!(classifier.detect_loop(), None);
    }

    #[test]
    fn test_suppression_outlives_loop_window() {
        let mut classifier = ErrorClassifier::new();
        let search = ToolError::opaque("search content not found");
        for _ in 0..3 {
            classifier.classify("edit_script", &search);
        }
        for category in [
            ErrorCategory::TypeError,
            ErrorCategory::PropertyError,
            ErrorCategory::SyntaxError,
        ] {
            classifier.classify("set_property", &ToolError::new(category, "bad"));
        }
        assert_ne!(classifier.detect_loop(), Some(ErrorCategory::SearchFailed));

        let again = classifier.classify("edit_script", &search);
        assert!(!again.escalated);
        assert!(!again.recovery_strategies.contains(&RecoveryStrategy::RereadState));
        assert!(!again.recovery_strategies.contains(&RecoveryStrategy::NarrowSelector));
        assert_eq!(again.recovery_strategies[0], RecoveryStrategy::ChangeApproach);

        classifier.reset_for_task();
        let fresh = classifier.classify("edit_script", &search);
        assert_eq!(fresh.recovery_strategies[0], RecoveryStrategy::RereadState);
    }

    #[test]
    fn test_user_denied_never_escalates() {
        let mut classifier = ErrorClassifier::new();
        let err = ToolError::new(ErrorCategory::UserDenied, "rejected by user");
        for _ in 0..4 {
            let c = classifier.classify("delete_instance", &err);
            assert!(!c.escalated);
            assert_eq!(c.severity, Severity::Info);
        }
    }
}
