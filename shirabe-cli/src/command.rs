//! REPLコマンド

/// 問い合わせコマンド
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// コンパイルユニット一覧
    Units,
    /// アドレスを含む関数・グローバル変数
    Lookup(u64),
    /// アドレスの関数・ブロック・行
    Context(u64),
    /// 名前で型を検索
    Type(String),
    /// 名前で関数を検索
    Function(String),
    /// 名前でグローバル変数を検索
    Variable(String),
    /// 識別子からエンティティを解決
    Uid(u64),
    /// キャッシュの件数
    Stats,
    /// ヘルプ表示
    Help,
    /// 終了
    Quit,
}

/// 16進（0x付き）または10進の数値を読む
pub fn parse_number(s: &str) -> Option<u64> {
    let s = s.trim();
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => s.parse().ok(),
    }
}

impl Command {
    /// コマンド文字列をパースする
    pub fn parse(input: &str) -> Option<Self> {
        let parts: Vec<&str> = input.split_whitespace().collect();
        let (&head, rest) = parts.split_first()?;
        let arg = rest.join(" ");

        match head {
            "units" | "u" => Some(Command::Units),
            "lookup" | "addr" => parse_number(&arg).map(Command::Lookup),
            "context" | "ctx" => parse_number(&arg).map(Command::Context),
            "type" | "t" if !arg.is_empty() => Some(Command::Type(arg)),
            "function" | "func" | "f" if !arg.is_empty() => Some(Command::Function(arg)),
            "variable" | "var" | "v" if !arg.is_empty() => Some(Command::Variable(arg)),
            "uid" => parse_number(&arg).map(Command::Uid),
            "stats" => Some(Command::Stats),
            "help" | "h" | "?" => Some(Command::Help),
            "quit" | "q" | "exit" => Some(Command::Quit),
            _ => None,
        }
    }
}
