//! bevy + bevy_llm_stream chat with a reasoning trace panel.
//! - type and press enter to send; escape stops the in-flight turn.
//! - f2 injects a sample reasoning envelope, the way a host transport that
//!   receives provider "thinking" events would.
//!
//! env:
//!   OPENAI_API_KEY   (key)
//!   LLM_BASE_URL     (default https://api.openai.com)
//!   LLM_MODEL        (default gpt-5)

use bevy::input::keyboard::{KeyCode, KeyboardInput};
use bevy::prelude::*;
use bevy_llm_stream::{
    ChatErrorEvt, ChatSession, Conversation, LLMBackend, LLMBuilder, LLMProvider,
    MessageCommitted, MessageRole, MessageStatus, Providers, RawReasoningEvent, ReasoningUpdated,
    StopStreaming, StreamInbox, StreamPlugin, StreamSet, push_reasoning_event, send_user_text,
};
use serde_json::json;
use std::sync::Arc;

#[derive(Component)]
struct TranscriptText;
#[derive(Component)]
struct ReasoningText;
#[derive(Component)]
struct PromptText;

#[derive(Resource)]
struct Session(Entity);

#[derive(Resource, Default)]
struct PromptBuf(String);

fn normalize_oai_base(base: &str) -> String {
    let b = base.trim_end_matches('/');
    if b.ends_with("/v1") { b.to_string() } else { format!("{}/v1", b) }
}

fn build_provider() -> Option<Arc<dyn LLMProvider>> {
    let base_url = std::env::var("LLM_BASE_URL").unwrap_or_else(|_| "https://api.openai.com".to_string());
    let api_key = std::env::var("OPENAI_API_KEY").unwrap_or_default();
    let model = std::env::var("LLM_MODEL").unwrap_or_else(|_| "gpt-5".to_string());
    info!(target: "chat", "build_provider: base_url='{}', model='{}', key_present={}", base_url, model, !api_key.is_empty());

    let mut b = LLMBuilder::new()
        .backend(LLMBackend::OpenAI)
        .base_url(format!("{}/responses", normalize_oai_base(&base_url)))
        .model(model)
        .system("think step by step, then answer briefly.");
    if !api_key.is_empty() {
        b = b.api_key(api_key);
    }
    match b.build() {
        Ok(p) => Some(p.into()),
        Err(err) => {
            error!(target: "chat", "could not build provider: {}", err);
            None
        }
    }
}

fn main() {
    let mut app = App::new();
    app.insert_resource(ClearColor(Color::srgb_u8(18, 18, 20)))
        .insert_resource(PromptBuf::default())
        .add_plugins(DefaultPlugins)
        .add_plugins(StreamPlugin)
        .add_systems(Startup, setup)
        .add_systems(Update, handle_input)
        .add_systems(
            Update,
            (refresh_transcript, refresh_reasoning, refresh_prompt, on_error).after(StreamSet::Flush),
        );
    if let Some(provider) = build_provider() {
        app.insert_resource(Providers::new(provider));
    }
    app.run();
}

fn setup(mut commands: Commands) {
    commands.spawn(Camera2d);
    let session = commands.spawn(ChatSession { key: None, stream: true }).id();
    commands.insert_resource(Session(session));

    let font = TextFont { font_size: 16.0, ..default() };
    commands
        .spawn(Node {
            width: Val::Percent(100.0),
            height: Val::Percent(100.0),
            flex_direction: FlexDirection::Column,
            row_gap: Val::Px(8.0),
            padding: UiRect::all(Val::Px(12.0)),
            ..default()
        })
        .with_children(|p| {
            p.spawn((Text::new(""), font.clone(), TextColor(Color::WHITE), TranscriptText));
            p.spawn((
                Text::new(""),
                font.clone(),
                TextColor(Color::srgb_u8(150, 170, 200)),
                ReasoningText,
            ));
            p.spawn((Text::new("> "), font, TextColor(Color::WHITE), PromptText));
        });
}

fn handle_input(
    mut commands: Commands,
    mut ev_kbd: EventReader<KeyboardInput>,
    keys: Res<ButtonInput<KeyCode>>,
    mut prompt: ResMut<PromptBuf>,
    session: Res<Session>,
    inbox: Res<StreamInbox>,
    mut ev_stop: EventWriter<StopStreaming>,
) {
    for ev in ev_kbd.read() {
        if ev.state.is_pressed()
            && let Some(txt) = &ev.text
        {
            let s = txt.replace(['\r', '\n'], "");
            if !s.chars().any(char::is_control) {
                prompt.0.push_str(&s);
            }
        }
    }
    if keys.just_pressed(KeyCode::Backspace) {
        prompt.0.pop();
    }
    if keys.just_pressed(KeyCode::Enter) && !prompt.0.trim().is_empty() {
        let msg = std::mem::take(&mut prompt.0);
        send_user_text(&mut commands, session.0, msg);
    }
    if keys.just_pressed(KeyCode::Escape) {
        ev_stop.write(StopStreaming { entity: session.0 });
    }
    if keys.just_pressed(KeyCode::F2) {
        let event = RawReasoningEvent::new(
            Some("thinking"),
            json!({ "payload": { "thought": "Step 1: restate the question", "thoughtNumber": 1, "totalThoughts": 2 } }),
        );
        if let Err(err) = push_reasoning_event(&inbox, session.0, event) {
            warn!(target: "chat", "reasoning event not queued: {}", err);
        }
    }
}

fn refresh_transcript(
    mut ev: EventReader<MessageCommitted>,
    session: Res<Session>,
    q_conv: Query<Ref<Conversation>>,
    mut q_text: Query<&mut Text, With<TranscriptText>>,
) {
    // a commit event or a status flip (complete/cancelled) both redraw
    let committed = ev.read().count() > 0;
    let Ok(conv) = q_conv.get(session.0) else { return };
    if !committed && !conv.is_changed() {
        return;
    }
    let Ok(mut t) = q_text.single_mut() else { return };

    let mut out = String::new();
    for m in conv.messages() {
        match &m.role {
            MessageRole::Human { text } => out.push_str(&format!("user: {}\n", text)),
            MessageRole::Assistant { text } => {
                let marker = match m.status {
                    MessageStatus::Pending => " ...",
                    MessageStatus::Streaming => " |",
                    MessageStatus::Cancelled => " [stopped]",
                    MessageStatus::Complete => "",
                };
                out.push_str(&format!("assistant: {}{}\n", text, marker));
            }
        }
    }
    t.0 = out;
}

fn refresh_reasoning(
    mut ev: EventReader<ReasoningUpdated>,
    q_conv: Query<&Conversation>,
    mut q_text: Query<&mut Text, With<ReasoningText>>,
) {
    for ReasoningUpdated { entity, message, finished } in ev.read() {
        let Some(trace) = q_conv
            .get(*entity)
            .ok()
            .and_then(|c| c.message(*message))
            .and_then(|m| m.reasoning.as_ref())
        else {
            continue;
        };
        let Ok(mut t) = q_text.single_mut() else { continue };
        if *finished && let Some(rendered) = &trace.rendered {
            t.0 = format!("reasoning (done):\n{}", rendered);
            continue;
        }
        let total = trace.total_steps.map(|n| n.to_string()).unwrap_or_else(|| "?".into());
        let mut out = format!("reasoning ({}/{}):\n", trace.steps.len(), total);
        for step in &trace.steps {
            match &step.title {
                Some(title) => out.push_str(&format!("  [{}] {}: {}\n", step.index, title, step.body)),
                None => out.push_str(&format!("  [{}] {}\n", step.index, step.body)),
            }
        }
        t.0 = out;
    }
}

fn refresh_prompt(prompt: Res<PromptBuf>, mut q_prompt: Query<&mut Text, With<PromptText>>) {
    if prompt.is_changed()
        && let Ok(mut t) = q_prompt.single_mut()
    {
        t.0 = format!("> {} |", prompt.0);
    }
}

fn on_error(mut ev: EventReader<ChatErrorEvt>) {
    for ChatErrorEvt { entity, error } in ev.read() {
        error!(target: "chat", "chat error (entity={:?}): {}", entity, error);
    }
}
