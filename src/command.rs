//! 指令解析工具

/// 尝试匹配前缀
///
/// 遍历 `prefixes`，如果 `content`（忽略首部空白）以其中任意一个开头，返回匹配到的前缀。
pub fn match_prefix(content: &str, prefixes: &[String]) -> Option<String> {
    let trimmed = content.trim_start();
    prefixes
        .iter()
        .filter(|p| !p.is_empty())
        .find(|p| trimmed.starts_with(p.as_str()))
        .cloned()
}

/// 匹配并剥离前缀，返回剩余部分（去掉首尾空白）
pub fn strip_prefix<'a>(content: &'a str, prefixes: &[String]) -> Option<&'a str> {
    let trimmed = content.trim_start();
    let prefix = match_prefix(trimmed, prefixes)?;
    Some(trimmed[prefix.len()..].trim())
}

/// 解析 `#指令 参数` 形式的文本
pub struct CommandMatch<'a> {
    pub name: &'a str,
    pub args: Vec<&'a str>,
}

pub fn parse_command<'a>(content: &'a str, leader: &str) -> Option<CommandMatch<'a>> {
    let body = content.trim().strip_prefix(leader)?;
    let mut parts = body.split_whitespace();
    let name = parts.next()?;
    Some(CommandMatch {
        name,
        args: parts.collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prefixes() -> Vec<String> {
        vec!["画".to_string(), "draw".to_string()]
    }

    #[test]
    fn matches_first_prefix() {
        assert_eq!(match_prefix("  画一只猫", &prefixes()).as_deref(), Some("画"));
        assert_eq!(match_prefix("draw a cat", &prefixes()).as_deref(), Some("draw"));
        assert_eq!(match_prefix("你好", &prefixes()), None);
        assert_eq!(match_prefix("anything", &[String::new()]), None);
    }

    #[test]
    fn strips_prefix() {
        assert_eq!(strip_prefix("画 一只猫 ", &prefixes()), Some("一只猫"));
        assert_eq!(strip_prefix("hello", &prefixes()), None);
    }

    #[test]
    fn parses_hash_commands() {
        let cmd = parse_command(" #reset  all ", "#").unwrap();
        assert_eq!(cmd.name, "reset");
        assert_eq!(cmd.args, vec!["all"]);
        assert!(parse_command("reset", "#").is_none());
        assert!(parse_command("#", "#").is_none());
    }
}
