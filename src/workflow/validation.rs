//! 结构校验
//!
//! 编译前的廉价检查：每条规则是一个独立谓词，不通过时给出一条缺陷描述。
//! 只看结构，不做语义分析。

/// 校验结论；passed 当且仅当 deficiencies 为空
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub passed: bool,
    pub deficiencies: Vec<String>,
}

impl Verdict {
    fn from_deficiencies(deficiencies: Vec<String>) -> Self {
        Self {
            passed: deficiencies.is_empty(),
            deficiencies,
        }
    }
}

type Rule = fn(&str) -> Option<String>;

fn require(code: &str, needle: &str, deficiency: &str) -> Option<String> {
    (!code.contains(needle)).then(|| deficiency.to_string())
}

fn shader_declaration(code: &str) -> Option<String> {
    let declared = code.lines().any(|line| {
        let line = line.trim_start();
        line.strip_prefix("Shader")
            .map(|rest| rest.trim_start().starts_with('"'))
            .unwrap_or(false)
    });
    (!declared).then(|| "Missing Shader declaration".to_string())
}

fn subshader(code: &str) -> Option<String> {
    require(code, "SubShader", "Missing SubShader block")
}

fn pass(code: &str) -> Option<String> {
    let has_pass = code
        .lines()
        .any(|line| line.trim_start().starts_with("Pass"));
    (!has_pass).then(|| "Missing Pass block".to_string())
}

fn vertex_pragma(code: &str) -> Option<String> {
    require(code, "#pragma vertex", "Missing #pragma vertex directive")
}

fn fragment_pragma(code: &str) -> Option<String> {
    require(code, "#pragma fragment", "Missing #pragma fragment directive")
}

fn urp_include(code: &str) -> Option<String> {
    require(
        code,
        "com.unity.render-pipelines",
        "Missing URP include (Packages/com.unity.render-pipelines.universal/...)",
    )
}

fn hlsl_program(code: &str) -> Option<String> {
    require(
        code,
        "HLSLPROGRAM",
        "Missing HLSLPROGRAM block (using CGPROGRAM instead of HLSL?)",
    )
}

fn end_hlsl(code: &str) -> Option<String> {
    require(code, "ENDHLSL", "Missing ENDHLSL")
}

fn balanced_programs(code: &str) -> Option<String> {
    let open = code.matches("HLSLPROGRAM").count();
    let close = code.matches("ENDHLSL").count();
    (open > 0 && close > 0 && open != close).then(|| {
        format!("Unbalanced HLSLPROGRAM/ENDHLSL blocks ({open} opened, {close} closed)")
    })
}

/// 跳过字符串与注释后检查花括号配对
fn balanced_braces(code: &str) -> Option<String> {
    let mut depth: i64 = 0;
    let mut line = 1;
    let mut chars = code.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '\n' => line += 1,
            '"' => {
                for c in chars.by_ref() {
                    match c {
                        '"' => break,
                        '\n' => {
                            line += 1;
                            break;
                        }
                        _ => {}
                    }
                }
            }
            '/' if chars.peek() == Some(&'/') => {
                for c in chars.by_ref() {
                    if c == '\n' {
                        line += 1;
                        break;
                    }
                }
            }
            '/' if chars.peek() == Some(&'*') => {
                chars.next();
                let mut prev = '\0';
                for c in chars.by_ref() {
                    if c == '\n' {
                        line += 1;
                    }
                    if prev == '*' && c == '/' {
                        break;
                    }
                    prev = c;
                }
            }
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth < 0 {
                    return Some(format!("Unbalanced braces: unexpected '}}' at line {line}"));
                }
            }
            _ => {}
        }
    }

    (depth != 0).then(|| format!("Unbalanced braces: {depth} unclosed '{{'"))
}

const RULES: &[Rule] = &[
    shader_declaration,
    subshader,
    pass,
    vertex_pragma,
    fragment_pragma,
    urp_include,
    hlsl_program,
    end_hlsl,
    balanced_programs,
    balanced_braces,
];

/// 校验门：对生成的着色器逐条执行规则
#[derive(Debug, Default, Clone, Copy)]
pub struct ValidationGate;

impl ValidationGate {
    pub fn new() -> Self {
        Self
    }

    /// 纯函数：同一输入总得到同一结论
    pub fn check(&self, code: &str) -> Verdict {
        if code.trim().is_empty() {
            return Verdict::from_deficiencies(vec!["Shader code is empty".to_string()]);
        }
        Verdict::from_deficiencies(RULES.iter().filter_map(|rule| rule(code)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MOCK_SHADER;

    #[test]
    fn test_valid_shader_passes() {
        let verdict = ValidationGate::new().check(MOCK_SHADER);
        assert!(verdict.passed, "{:?}", verdict.deficiencies);
        assert!(verdict.deficiencies.is_empty());
    }

    #[test]
    fn test_missing_pass_reported() {
        let code = MOCK_SHADER.replace("        Pass\n", "        \n");
        let verdict = ValidationGate::new().check(&code);
        assert!(!verdict.passed);
        assert_eq!(verdict.deficiencies, vec!["Missing Pass block".to_string()]);
    }

    #[test]
    fn test_cgprogram_reports_both_hlsl_markers() {
        let code = MOCK_SHADER
            .replace("HLSLPROGRAM", "CGPROGRAM")
            .replace("ENDHLSL", "ENDCG");
        let verdict = ValidationGate::new().check(&code);
        assert!(verdict
            .deficiencies
            .iter()
            .any(|d| d.starts_with("Missing HLSLPROGRAM")));
        assert!(verdict.deficiencies.contains(&"Missing ENDHLSL".to_string()));
    }

    #[test]
    fn test_unbalanced_braces() {
        let code = format!("{MOCK_SHADER}\n{{");
        let verdict = ValidationGate::new().check(&code);
        assert_eq!(
            verdict.deficiencies,
            vec!["Unbalanced braces: 1 unclosed '{'".to_string()]
        );

        let code = format!("}}\n{MOCK_SHADER}");
        let verdict = ValidationGate::new().check(&code);
        assert!(verdict.deficiencies[0].contains("unexpected '}' at line 1"));
    }

    #[test]
    fn test_braces_inside_comments_and_strings_ignored() {
        let code = MOCK_SHADER.replace(
            "return _BaseColor;",
            "// {{ not a block\n                return _BaseColor; /* } */",
        );
        let verdict = ValidationGate::new().check(&code);
        assert!(verdict.passed, "{:?}", verdict.deficiencies);
    }

    #[test]
    fn test_empty_code() {
        let verdict = ValidationGate::new().check("   ");
        assert!(!verdict.passed);
        assert_eq!(verdict.deficiencies.len(), 1);
    }

    #[test]
    fn test_deterministic() {
        let gate = ValidationGate::new();
        let code = "Shader \"X\" { SubShader { } }";
        assert_eq!(gate.check(code), gate.check(code));
    }
}
