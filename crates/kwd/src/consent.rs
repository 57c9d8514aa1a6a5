//! Consent prompts answered on the controlling terminal

use anyhow::Result;
use dialoguer::{Confirm, Input, MultiSelect};
use kw_broker::{Consent, ConsentPrompt, ConsentReply, ConsentRequest};
use std::time::Duration;
use tracing::warn;

/// A consent provider backed by dialoguer prompts. Prompts run on the
/// blocking pool one at a time.
pub fn terminal(timeout: Duration) -> Consent {
    let (consent, mut rx) = Consent::channel(timeout);
    tokio::spawn(async move {
        while let Some(ConsentRequest { prompt, reply }) = rx.recv().await {
            match tokio::task::spawn_blocking(move || ask(&prompt)).await {
                Ok(Ok(answer)) => {
                    // the broker may have timed out meanwhile
                    let _ = reply.send(answer);
                }
                Ok(Err(e)) => warn!("consent prompt failed: {e}"),
                Err(e) => warn!("consent prompt panicked: {e}"),
            }
        }
    });
    consent
}

fn ask(prompt: &ConsentPrompt) -> Result<ConsentReply> {
    eprintln!();
    match prompt {
        ConsentPrompt::Associate { client_id } => {
            let allow = Confirm::new()
                .with_prompt(format!("Client {client_id:?} wants to connect. Allow?"))
                .default(false)
                .interact()?;
            if !allow {
                let remember = Confirm::new()
                    .with_prompt("Always refuse this client?")
                    .default(false)
                    .interact()?;
                return Ok(ConsentReply {
                    remember,
                    ..ConsentReply::deny()
                });
            }
            let label: String = Input::new()
                .with_prompt("Name for this client")
                .default(client_id.clone())
                .interact_text()?;
            let remember = Confirm::new()
                .with_prompt("Release matching logins without asking each time?")
                .default(false)
                .interact()?;
            Ok(ConsentReply {
                remember,
                ..ConsentReply::allow().labelled(label)
            })
        }
        ConsentPrompt::Access {
            label, url, entries, ..
        } => {
            let titles: Vec<&str> = entries.iter().map(|(_, t)| t.as_str()).collect();
            let picked = MultiSelect::new()
                .with_prompt(format!("{label} requests logins for {url}"))
                .items(&titles)
                .defaults(&vec![true; titles.len()])
                .interact()?;
            let remember = Confirm::new()
                .with_prompt("Remember these choices?")
                .default(false)
                .interact()?;
            if picked.is_empty() {
                return Ok(ConsentReply {
                    remember,
                    ..ConsentReply::deny()
                });
            }
            let granted = picked.into_iter().map(|i| entries[i].0).collect();
            Ok(ConsentReply {
                remember,
                ..ConsentReply::allow().only(granted)
            })
        }
        ConsentPrompt::Store {
            label,
            url,
            username,
            existing,
            ..
        } => {
            let question = match existing {
                Some((_, title)) => format!("{label} wants to update {title:?} ({username}). Allow?"),
                None => format!("{label} wants to save a login for {username} at {url}. Allow?"),
            };
            let allow = Confirm::new()
                .with_prompt(question)
                .default(false)
                .interact()?;
            let remember = existing.is_some()
                && Confirm::new()
                    .with_prompt("Remember this choice for the entry?")
                    .default(false)
                    .interact()?;
            let reply = if allow {
                ConsentReply::allow()
            } else {
                ConsentReply::deny()
            };
            Ok(ConsentReply { remember, ..reply })
        }
    }
}
