//! Built-in stages: idea, script, character references, video, audio and
//! integration.

use std::sync::Arc;

use serde_json::json;

use super::script::{parse_script, Script};
use super::stage::{Stage, StageContext, StageOutput};
use super::PipelineError;
use crate::backend::{GenerationOperation, GenerationRequest, MediaKind, MediaResult};

pub const IDEA: &str = "idea";
pub const SCRIPT: &str = "script";
pub const CHARACTER_REFS: &str = "character_refs";
pub const VIDEO: &str = "video";
pub const AUDIO: &str = "audio";
pub const INTEGRATION: &str = "integration";

/// The standard stage sequence.
pub fn default_stages() -> Vec<Arc<dyn Stage>> {
    vec![
        Arc::new(IdeaStage),
        Arc::new(ScriptStage),
        Arc::new(CharacterRefsStage),
        Arc::new(VideoStage),
        Arc::new(AudioStage),
        Arc::new(IntegrationStage),
    ]
}

fn operation(ctx: &StageContext<'_>, kind: MediaKind, default_model: &str, prompt: &str) -> GenerationOperation {
    let settings = ctx.settings();
    let mut op = GenerationOperation::new(kind, ctx.model_or(default_model))
        .with_input_size(settings.input_size.unwrap_or(prompt.chars().count() as u64));
    if let Some(complexity) = settings.complexity {
        op = op.with_complexity(complexity);
    }
    op
}

fn request(
    ctx: &StageContext<'_>,
    id: String,
    kind: MediaKind,
    default_model: &str,
    prompt: String,
) -> GenerationRequest {
    let op = operation(ctx, kind, default_model, &prompt);
    GenerationRequest::new(id, op, prompt).with_extra("purpose", ctx.stage_id)
}

fn text_of<'r>(ctx: &StageContext<'_>, result: &'r MediaResult) -> Result<&'r str, PipelineError> {
    result
        .text
        .as_deref()
        .ok_or_else(|| ctx.error(format!("request {} returned no text", result.request_id)))
}

/// The script written by the script stage, limited to `max_scenes` scenes.
fn load_script(ctx: &StageContext<'_>) -> Result<Script, PipelineError> {
    let output = ctx.require_output(SCRIPT)?;
    let mut script: Script = serde_json::from_value(output["script"].clone())
        .map_err(|e| ctx.error(format!("unreadable script output: {}", e)))?;
    script.scenes.truncate(ctx.config.max_scenes);
    Ok(script)
}

fn asset_list(results: &[MediaResult]) -> Vec<serde_json::Value> {
    results
        .iter()
        .map(|r| json!({ "request_id": r.request_id, "asset_ref": r.asset_ref }))
        .collect()
}

/// Turns the brief into a concept.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdeaStage;

impl Stage for IdeaStage {
    fn id(&self) -> &str {
        IDEA
    }

    fn plan(&self, ctx: &StageContext<'_>) -> Result<Vec<GenerationRequest>, PipelineError> {
        let prompt = format!("Develop a short video concept for: {}", ctx.state.brief);
        Ok(vec![request(ctx, "concept".to_string(), MediaKind::Text, "text-default", prompt)])
    }

    fn finish(&self, ctx: &StageContext<'_>, results: &[MediaResult]) -> Result<StageOutput, PipelineError> {
        let concept = match results.first() {
            Some(result) => text_of(ctx, result)?,
            None => return Err(ctx.error("no concept produced")),
        };
        Ok(StageOutput::new(json!({ "concept": concept })))
    }
}

/// Writes the script and registers its characters.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScriptStage;

impl Stage for ScriptStage {
    fn id(&self) -> &str {
        SCRIPT
    }

    fn plan(&self, ctx: &StageContext<'_>) -> Result<Vec<GenerationRequest>, PipelineError> {
        let concept = ctx.require_output(IDEA)?["concept"].as_str().unwrap_or_default();
        let prompt = format!(
            "Write a script of at most {} scenes for this concept. Answer with JSON \
             {{\"title\", \"characters\": [{{\"name\", \"description\"}}], \
             \"scenes\": [{{\"description\", \"characters\", \"narration\"}}]}}.\n\n{}",
            ctx.config.max_scenes, concept
        );
        let request = request(ctx, "script".to_string(), MediaKind::Text, "text-default", prompt)
            .with_extra("max_scenes", ctx.config.max_scenes as u64);
        Ok(vec![request])
    }

    fn finish(&self, ctx: &StageContext<'_>, results: &[MediaResult]) -> Result<StageOutput, PipelineError> {
        let text = match results.first() {
            Some(result) => text_of(ctx, result)?,
            None => return Err(ctx.error("no script produced")),
        };
        let parsed = parse_script(text);
        let format = if parsed.is_structured() { "structured" } else { "heuristic" };
        let mut script = parsed.into_script();
        script.scenes.truncate(ctx.config.max_scenes);
        if script.scenes.is_empty() {
            return Err(ctx.error("script has no scenes"));
        }

        let mut warnings = Vec::new();
        for character in &script.characters {
            let outcome = ctx.characters.upsert(&character.name, &character.description);
            if let Some(conflict) = outcome.conflict {
                warnings.push(format!(
                    "character '{}' description changed from '{}' to '{}'",
                    conflict.name, conflict.previous, conflict.incoming
                ));
            }
        }

        let value = json!({
            "format": format,
            "script": serde_json::to_value(&script).map_err(|e| ctx.error(e.to_string()))?,
        });
        Ok(StageOutput::new(value).with_warnings(warnings))
    }
}

/// Produces one reference image per character.
#[derive(Debug, Clone, Copy, Default)]
pub struct CharacterRefsStage;

impl Stage for CharacterRefsStage {
    fn id(&self) -> &str {
        CHARACTER_REFS
    }

    fn plan(&self, ctx: &StageContext<'_>) -> Result<Vec<GenerationRequest>, PipelineError> {
        let script = load_script(ctx)?;
        let store = ctx.characters.read();
        let requests = script
            .characters
            .iter()
            .enumerate()
            .filter_map(|(i, character)| {
                let record = store.record(&character.name)?;
                let prompt = format!(
                    "Character reference sheet, neutral pose. {}: {}",
                    record.name, record.description
                );
                Some(
                    request(ctx, format!("character-{}", i + 1), MediaKind::Image, "image-default", prompt)
                        .with_extra("character", record.name.clone()),
                )
            })
            .collect();
        Ok(requests)
    }

    fn finish(&self, ctx: &StageContext<'_>, results: &[MediaResult]) -> Result<StageOutput, PipelineError> {
        let script = load_script(ctx)?;
        let mut store = ctx.characters.write();
        let mut references = serde_json::Map::new();
        let known = script
            .characters
            .iter()
            .filter(|c| store.record(&c.name).is_some())
            .map(|c| c.name.clone())
            .collect::<Vec<_>>();
        for (name, result) in known.iter().zip(results) {
            if let Some(asset) = &result.asset_ref {
                store.set_reference_asset(name, asset.clone());
                references.insert(name.clone(), json!(asset));
            }
        }
        Ok(StageOutput::new(json!({ "references": references })))
    }
}

/// Renders one clip per scene with the scene's character descriptions
/// injected.
#[derive(Debug, Clone, Copy, Default)]
pub struct VideoStage;

impl Stage for VideoStage {
    fn id(&self) -> &str {
        VIDEO
    }

    fn plan(&self, ctx: &StageContext<'_>) -> Result<Vec<GenerationRequest>, PipelineError> {
        let script = load_script(ctx)?;
        let store = ctx.characters.read();
        let requests = script
            .scenes
            .iter()
            .enumerate()
            .map(|(i, scene)| {
                let names: Vec<&str> = scene.characters.iter().map(String::as_str).collect();
                let cast = store.prompt_fragment(&names);
                let prompt = if cast.is_empty() {
                    scene.description.clone()
                } else {
                    format!("{}\n\nCharacters:\n{}", scene.description, cast)
                };
                let references: Vec<String> = names
                    .iter()
                    .filter_map(|name| store.record(name)?.reference_asset_ref.clone())
                    .collect();
                request(ctx, format!("scene-{}", i + 1), MediaKind::Video, "video-default", prompt)
                    .with_extra("scene", (i + 1) as u64)
                    .with_extra("reference_assets", references)
            })
            .collect();
        Ok(requests)
    }

    fn finish(&self, ctx: &StageContext<'_>, results: &[MediaResult]) -> Result<StageOutput, PipelineError> {
        let script = load_script(ctx)?;
        let mut store = ctx.characters.write();
        for scene in &script.scenes {
            for name in &scene.characters {
                store.record_appearance(name, ctx.stage_id);
            }
        }
        Ok(StageOutput::new(json!({ "clips": asset_list(results) })))
    }
}

/// Narration track per scene.
#[derive(Debug, Clone, Copy, Default)]
pub struct AudioStage;

impl Stage for AudioStage {
    fn id(&self) -> &str {
        AUDIO
    }

    fn plan(&self, ctx: &StageContext<'_>) -> Result<Vec<GenerationRequest>, PipelineError> {
        let script = load_script(ctx)?;
        let requests = script
            .scenes
            .iter()
            .enumerate()
            .filter(|(_, scene)| !scene.narration.trim().is_empty())
            .map(|(i, scene)| {
                request(ctx, format!("narration-{}", i + 1), MediaKind::Audio, "tts-default", scene.narration.clone())
                    .with_extra("scene", (i + 1) as u64)
            })
            .collect();
        Ok(requests)
    }

    fn finish(&self, _ctx: &StageContext<'_>, results: &[MediaResult]) -> Result<StageOutput, PipelineError> {
        Ok(StageOutput::new(json!({ "tracks": asset_list(results) })))
    }
}

/// Assembles the final manifest from earlier outputs. Sends nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct IntegrationStage;

impl Stage for IntegrationStage {
    fn id(&self) -> &str {
        INTEGRATION
    }

    fn plan(&self, _ctx: &StageContext<'_>) -> Result<Vec<GenerationRequest>, PipelineError> {
        Ok(Vec::new())
    }

    fn finish(&self, ctx: &StageContext<'_>, _results: &[MediaResult]) -> Result<StageOutput, PipelineError> {
        let script = load_script(ctx)?;
        let clips = ctx.require_output(VIDEO)?["clips"].clone();
        let tracks = ctx
            .state
            .output(AUDIO)
            .map(|audio| audio["tracks"].clone())
            .unwrap_or_else(|| json!([]));
        let store = ctx.characters.read();
        let characters: Vec<serde_json::Value> = store
            .names()
            .iter()
            .filter_map(|name| store.record(name))
            .map(|record| {
                json!({
                    "name": record.name,
                    "description": record.description,
                    "reference_asset_ref": record.reference_asset_ref,
                    "appearances": record.appearances,
                })
            })
            .collect();
        drop(store);

        let mut warnings = Vec::new();
        if tracks.as_array().map(|t| t.is_empty()).unwrap_or(true) {
            warnings.push("manifest has no audio tracks".to_string());
        }
        Ok(StageOutput::new(json!({
            "title": script.title,
            "clips": clips,
            "tracks": tracks,
            "characters": characters,
        }))
        .with_warnings(warnings))
    }
}
