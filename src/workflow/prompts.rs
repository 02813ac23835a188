//! 各阶段提示词与模型输出解析

use std::sync::OnceLock;

use regex::Regex;

use crate::memory::Message;
use crate::workflow::ShaderTask;

/// 无法从代码中提取名称时使用
pub const DEFAULT_SHADER_NAME: &str = "Generated/Shader";

const IMAGE_ANALYSIS_PROMPT: &str = "You are a visual effects expert analyzing images for shader recreation.
Describe the visual elements, lighting, colors, and special effects visible in the image.

Focus on aspects that can be recreated with shaders:
- Art style: toon/cel-shaded, realistic PBR, pixel art, watercolor
- Color palette: dominant colors and their relationships
- Lighting: rim light, ambient, directional
- Surface properties: metallic, rough, glossy, matte
- Special effects: glow, outline, distortion, gradients
- Shading model: number of color bands, gradient smoothness, shadow colors

Provide a structured analysis that can guide shader generation.";

const REQUIREMENT_ANALYSIS_PROMPT: &str = "You are a shader expert. Analyze the user's shader requirement and extract:

1. Shader type: surface, unlit, post-process effect
2. Visual effects: rim lighting, outline, dissolve
3. Properties: colors, textures, floats to expose
4. Technical notes: transparency, double-sided, shadows

Format your response as a structured analysis. Keep it concise and technical.";

const NEW_SHADER_PROMPT: &str = r#"You are an expert Unity shader programmer specializing in URP (Universal Render Pipeline).
Generate a complete, valid HLSL shader for Unity URP based on the requirements.

CRITICAL RULES:
1. Use URP shader structure with proper includes
2. Include all necessary pragmas (#pragma vertex, #pragma fragment)
3. Use HLSL syntax (HLSLPROGRAM / ENDHLSL), not CG
4. Put material properties in a UnityPerMaterial CBUFFER
5. Use TEXTURE2D and SAMPLER macros for textures
6. Include proper Tags for URP compatibility

Shader structure template:
```hlsl
Shader "Custom/ShaderName"
{
    Properties
    {
    }
    SubShader
    {
        Tags { "RenderType"="Opaque" "RenderPipeline"="UniversalPipeline" }
        Pass
        {
            HLSLPROGRAM
            #pragma vertex vert
            #pragma fragment frag
            #include "Packages/com.unity.render-pipelines.universal/ShaderLibrary/Core.hlsl"
            ENDHLSL
        }
    }
}
```

Respond with ONLY the complete shader code. No explanations before or after."#;

const MODIFY_SHADER_PROMPT: &str = "You are an expert Unity shader programmer specializing in URP (Universal Render Pipeline).
You are MODIFYING an existing shader based on the user's request.

CRITICAL RULES:
1. Preserve the overall structure of the existing shader
2. Only change what the user specifically requests
3. Keep all existing properties unless explicitly asked to remove them
4. Maintain URP compatibility
5. Keep the shader compilable

Respond with ONLY the complete modified shader code. No explanations before or after.";

const FIX_PROMPT: &str =
    "You are a shader debugging expert. Fix the shader validation errors. Output only the corrected, complete shader code.";

pub fn image_analysis(task: &ShaderTask) -> Vec<Message> {
    let input = task.input();
    let user = Message::user(format!(
        "Analyze this image for shader recreation.\n\nUser context: {}",
        input.requirement
    ));
    let user = match &input.reference_image {
        Some(image) => user.with_image(image.clone()),
        None => user,
    };
    vec![Message::system(IMAGE_ANALYSIS_PROMPT), user]
}

pub fn requirement_analysis(task: &ShaderTask) -> Vec<Message> {
    let mut content = format!("Shader requirement: {}", task.input().requirement);
    if let Some(image) = task.image_analysis() {
        content.push_str(&format!(
            "\n\n---\nReference image analysis:\n{image}\n\nIncorporate the visual style from the image analysis into your shader analysis."
        ));
    }
    vec![
        Message::system(REQUIREMENT_ANALYSIS_PROMPT),
        Message::user(content),
    ]
}

/// 分析结果与图片分析合并后交给生成阶段
pub fn combine_analysis(requirement: &str, image: Option<&str>) -> String {
    match image {
        Some(image) => format!(
            "User requirement analysis:\n{requirement}\n\nImage style analysis:\n{image}"
        ),
        None => requirement.to_string(),
    }
}

pub fn generation(task: &ShaderTask) -> Vec<Message> {
    let input = task.input();
    let modifying = input.is_modification && input.previous_code.is_some();

    let mut content = if input.conversation_context.trim().is_empty() {
        format!("Requirement: {}", input.requirement)
    } else {
        format!(
            "Conversation context:\n{}\n\nCurrent request: {}",
            input.conversation_context, input.requirement
        )
    };

    if let (true, Some(previous)) = (modifying, &input.previous_code) {
        content.push_str(&format!(
            "\n\nExisting shader to modify:\n```hlsl\n{previous}\n```"
        ));
    }

    if let Some(analysis) = task.requirement_analysis() {
        content.push_str(&format!("\n\nAnalysis:\n{analysis}"));
    }

    if task.retry_count() > 0 && !task.compile_result().is_success() {
        content.push_str("\n\nPrevious code had compilation errors:\n");
        content.push_str(&task.compile_result().error_lines().join("\n"));
        if task.error_history().len() > 1 {
            content.push_str("\n\nEarlier attempts:\n");
            content.push_str(&task.error_history().join("\n"));
        }
        content.push_str("\n\nPlease fix these errors in the new version.");
        if !task.generated_code().is_empty() {
            content.push_str(&format!(
                "\n\nPrevious code:\n```hlsl\n{}\n```",
                task.generated_code()
            ));
        }
    }

    let system = if modifying {
        MODIFY_SHADER_PROMPT
    } else {
        NEW_SHADER_PROMPT
    };
    vec![Message::system(system), Message::user(content)]
}

pub fn fix(task: &ShaderTask) -> Vec<Message> {
    let errors = task
        .deficiencies()
        .iter()
        .map(|d| format!("- {d}"))
        .collect::<Vec<_>>()
        .join("\n");
    let content = format!(
        "Validation errors:\n{errors}\n\nCurrent shader code:\n```hlsl\n{}\n```\n\nProvide the COMPLETE fixed shader code. Ensure all validation issues are resolved.",
        task.generated_code()
    );
    vec![Message::system(FIX_PROMPT), Message::user(content)]
}

/// 取第一个围栏代码块；没有则从 `Shader "` 处截取；都没有则原样返回
pub fn extract_shader_code(response: &str) -> String {
    if response.contains("```") {
        let mut in_block = false;
        let mut lines = Vec::new();
        for line in response.lines() {
            if line.trim_start().starts_with("```") {
                if in_block {
                    break;
                }
                in_block = true;
                continue;
            }
            if in_block {
                lines.push(line);
            }
        }
        if !lines.is_empty() {
            return lines.join("\n");
        }
    }

    match response.find("Shader \"") {
        Some(start) => response[start..].trim().to_string(),
        None => response.trim().to_string(),
    }
}

fn shader_name_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"Shader\s+"([^"]+)""#).expect("valid shader name pattern"))
}

pub fn extract_shader_name(code: &str) -> String {
    shader_name_regex()
        .captures(code)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
        .unwrap_or_else(|| DEFAULT_SHADER_NAME.to_string())
}
