//! デバッガコマンド

/// デバッガコマンド
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// ブレークポイントを設定
    Break(String),
    /// ブレークポイントを削除
    Delete(u32),
    /// 実行継続
    Continue,
    /// 1命令ステップ（呼び出しに入る）
    StepInstruction,
    /// 1命令ステップ（呼び出しをまたぐ）
    NextInstruction,
    /// 指定したフレームから抜けるまで実行
    Finish(usize),
    /// バックトレース表示
    Backtrace,
    /// プランスタック表示
    Plans { verbose: bool },
    /// ヘルプ表示
    Help,
    /// 終了
    Quit,
}

impl Command {
    /// コマンド文字列をパースする
    pub fn parse(input: &str) -> Option<Self> {
        let parts: Vec<&str> = input.split_whitespace().collect();
        let (&name, args) = parts.split_first()?;

        match name {
            "break" | "b" => {
                if args.is_empty() {
                    None
                } else {
                    Some(Command::Break(args.join(" ")))
                }
            }
            "delete" | "d" => args.first()?.parse().ok().map(Command::Delete),
            "continue" | "c" => Some(Command::Continue),
            "stepi" | "si" => Some(Command::StepInstruction),
            "nexti" | "ni" => Some(Command::NextInstruction),
            "finish" | "fin" => match args.first() {
                Some(frame) => frame.parse().ok().map(Command::Finish),
                None => Some(Command::Finish(0)),
            },
            "backtrace" | "bt" => Some(Command::Backtrace),
            "plans" => Some(Command::Plans {
                verbose: args.first() == Some(&"-v"),
            }),
            "help" | "h" | "?" => Some(Command::Help),
            "quit" | "q" | "exit" => Some(Command::Quit),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_commands() {
        assert_eq!(Command::parse("continue"), Some(Command::Continue));
        assert_eq!(Command::parse("c"), Some(Command::Continue));
        assert_eq!(Command::parse("si"), Some(Command::StepInstruction));
        assert_eq!(Command::parse("finish"), Some(Command::Finish(0)));
        assert_eq!(Command::parse("finish 2"), Some(Command::Finish(2)));
        assert_eq!(Command::parse("plans -v"), Some(Command::Plans { verbose: true }));
        assert_eq!(Command::parse("delete 3"), Some(Command::Delete(3)));
        assert_eq!(Command::parse("quit"), Some(Command::Quit));
    }

    #[test]
    fn test_parse_rejects_bad_arguments() {
        assert_eq!(Command::parse(""), None);
        assert_eq!(Command::parse("break"), None);
        assert_eq!(Command::parse("finish x"), None);
        assert_eq!(Command::parse("delete"), None);
        assert_eq!(Command::parse("frobnicate"), None);
    }
}
