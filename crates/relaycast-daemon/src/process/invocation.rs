//! Relay executable command line.

use std::path::{Path, PathBuf};

use relaycast_core::config::RelayProfile;
use relaycast_core::credentials::redact;
use relaycast_core::registry::Destination;

/// Fully resolved command line for one relay process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayInvocation {
    /// Destination this relay pushes to.
    pub destination_id: String,
    pub program: PathBuf,
    pub args: Vec<String>,
    /// Printable form of the command line with the stream key redacted.
    pub redacted: String,
}

impl RelayInvocation {
    /// Build the relay command line: pull `ingest_url`, copy video, re-encode
    /// audio to the profile and push to the destination's egress URL for
    /// `key`.
    pub fn build(
        destination: &Destination,
        program: &Path,
        profile: &RelayProfile,
        ingest_url: &str,
        key: &str,
    ) -> Self {
        let mut args: Vec<String> = Vec::with_capacity(32);
        let push = |args: &mut Vec<String>, flag: &str, value: &str| {
            args.push(flag.to_string());
            args.push(value.to_string());
        };

        push(&mut args, "-loglevel", "info");
        if profile.reconnect {
            push(&mut args, "-reconnect", "1");
            push(&mut args, "-reconnect_at_eof", "1");
            push(&mut args, "-reconnect_streamed", "1");
            push(
                &mut args,
                "-reconnect_delay_max",
                &profile.reconnect_delay_max_secs.to_string(),
            );
        }
        push(&mut args, "-i", ingest_url);
        push(&mut args, "-c:v", "copy");
        push(&mut args, "-c:a", &profile.audio_codec);
        push(&mut args, "-b:a", &profile.audio_bitrate);
        push(&mut args, "-ar", &profile.audio_sample_rate.to_string());
        push(&mut args, "-ac", &profile.audio_channels.to_string());
        args.extend(profile.extra_args.iter().cloned());
        push(&mut args, "-f", &profile.container);
        args.push("-y".to_string());

        let egress = destination.egress_url(key);
        let redacted_egress = destination.egress_url(&redact(key));
        let redacted = std::iter::once(program.display().to_string())
            .chain(args.iter().cloned())
            .chain(std::iter::once(redacted_egress))
            .collect::<Vec<_>>()
            .join(" ");
        args.push(egress);

        Self {
            destination_id: destination.id.clone(),
            program: program.to_path_buf(),
            args,
            redacted,
        }
    }
}
