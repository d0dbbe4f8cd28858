use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use log::{info, warn};

use crate::api::{self, PostId};
use crate::config;
use crate::data::{ApiPostService, MockPostService, PostService};
use crate::feed::{FeedController, FeedError, NoticeKind};
use crate::session::{self, Session};
use crate::trigger::Sentinel;

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub config_file: Option<PathBuf>,
    pub offline: bool,
}

pub fn run(options: RunOptions) -> Result<()> {
    let cfg = config::load(config::LoadOptions {
        config_file: options.config_file,
        env_prefix: None,
    })
    .context("load config")?;

    let service: Arc<dyn PostService> = if options.offline {
        info!("running against the built-in sample feed");
        Arc::new(MockPostService::default())
    } else {
        let session = Session::load(&cfg.session).context("load session")?;
        if let Err(err) = session.require() {
            warn!("{err}; requests are sent without a token");
        }
        let client = api::Client::new(
            Arc::new(session),
            api::ClientConfig {
                user_agent: cfg.api.user_agent.clone(),
                base_url: Some(cfg.api.base_url.clone()),
                page_size: Some(cfg.api.page_size),
                timeout: Some(cfg.api.timeout),
                http_client: None,
            },
        )
        .context("build api client")?;
        info!("using feed at {}", client.base_url());
        Arc::new(ApiPostService::new(Arc::new(client)))
    };

    let mut feed = FeedController::new(service, cfg.feed.clone().into());
    let wait = cfg.api.timeout + Duration::from_secs(1);
    let stdin = io::stdin();
    let mut stdout = io::stdout();
    let result = run_commands(&mut feed, stdin.lock(), &mut stdout, wait);
    feed.shutdown();
    result
}

/// Writes `token` to the configured token file and returns a display path.
pub fn save_session_token(config_file: Option<PathBuf>, token: &str) -> Result<String> {
    let cfg = config::load(config::LoadOptions {
        config_file,
        env_prefix: None,
    })
    .context("load config")?;
    let path = cfg
        .session
        .token_file
        .context("session: unable to determine token file path")?;
    session::save_token(&path, token)?;
    Ok(friendly_path(&path))
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Command {
    More,
    Post(String),
    Like(PostId),
    Delete(PostId),
    Edit(PostId, String),
    Reload,
    List,
    Help,
    Quit,
}

const HELP: &str = "Commands:
  more                 load the next page
  post <text>          create a post
  like <id>            like or unlike a post
  edit <id> <text>     replace a post's text
  delete <id>          delete a post
  reload               start over from the first page
  list                 show the feed again
  quit                 exit";

fn parse_command(line: &str) -> Result<Command, String> {
    let line = line.trim();
    let (word, rest) = match line.split_once(char::is_whitespace) {
        Some((word, rest)) => (word, rest.trim()),
        None => (line, ""),
    };
    let id = |text: &str| {
        text.parse::<PostId>()
            .map_err(|_| format!("expected a post id, got {text:?}"))
    };
    match word.to_ascii_lowercase().as_str() {
        "more" | "m" => Ok(Command::More),
        "post" | "p" => Ok(Command::Post(rest.to_string())),
        "like" | "l" => id(rest).map(Command::Like),
        "delete" | "d" => id(rest).map(Command::Delete),
        "edit" | "e" => {
            let (target, text) = rest
                .split_once(char::is_whitespace)
                .unwrap_or((rest, ""));
            Ok(Command::Edit(id(target)?, text.trim().to_string()))
        }
        "reload" | "r" => Ok(Command::Reload),
        "list" | "ls" | "" => Ok(Command::List),
        "help" | "h" | "?" => Ok(Command::Help),
        "quit" | "q" | "exit" => Ok(Command::Quit),
        other => Err(format!("unknown command {other:?} (try `help`)")),
    }
}

/// Line-driven front end: one command per line, feed re-rendered after each.
pub fn run_commands<R, W>(
    feed: &mut FeedController,
    input: R,
    out: &mut W,
    wait: Duration,
) -> Result<()>
where
    R: BufRead,
    W: Write,
{
    let mut sentinel = Sentinel::new(feed.events());

    feed.load_next_page();
    settle(feed, &mut sentinel, wait);
    render(feed, out)?;

    for line in input.lines() {
        let line = line.context("read command")?;
        let command = match parse_command(&line) {
            Ok(command) => command,
            Err(message) => {
                writeln!(out, "{message}")?;
                continue;
            }
        };
        match command {
            Command::Quit => break,
            Command::Help => {
                writeln!(out, "{HELP}")?;
                continue;
            }
            Command::More => {
                if !feed.has_more() {
                    writeln!(out, "No more posts.")?;
                }
                sentinel.observe(true);
            }
            Command::Post(text) => report(out, feed.create_post(&text))?,
            Command::Like(id) => {
                if !feed.toggle_like(id) {
                    writeln!(out, "{}", FeedError::UnknownPost(id))?;
                }
            }
            Command::Delete(id) => {
                if feed.is_delete_pending(id) {
                    writeln!(out, "Already deleting post {id}.")?;
                } else if !feed.delete_post(id) {
                    writeln!(out, "{}", FeedError::UnknownPost(id))?;
                }
            }
            Command::Edit(id, text) => report(out, feed.edit_post(id, &text))?,
            Command::Reload => {
                feed.reload();
            }
            Command::List => {}
        }
        settle(feed, &mut sentinel, wait);
        render(feed, out)?;
    }
    out.flush()?;
    Ok(())
}

fn settle(feed: &mut FeedController, sentinel: &mut Sentinel, wait: Duration) {
    let pump = feed.wait_idle(wait);
    if pump.page_settled {
        sentinel.rearm();
    }
    if feed.in_flight() > 0 {
        warn!("{} request(s) still in flight after {:?}", feed.in_flight(), wait);
    }
}

fn report<W: Write>(out: &mut W, result: Result<(), FeedError>) -> io::Result<()> {
    match result {
        Ok(()) => Ok(()),
        Err(err) => writeln!(out, "{err}"),
    }
}

fn render<W: Write>(feed: &FeedController, out: &mut W) -> io::Result<()> {
    writeln!(out)?;
    if feed.posts().is_empty() {
        writeln!(out, "(no posts yet)")?;
    }
    for post in feed.posts() {
        let author = if post.owner_username.is_empty() {
            "unknown"
        } else {
            post.owner_username.as_str()
        };
        let heart = if post.is_liked { "♥" } else { "♡" };
        let noun = if post.likes_count == 1 { "like" } else { "likes" };
        let mine = if post.is_owner { "  [yours]" } else { "" };
        writeln!(
            out,
            "#{:<5} @{}  {} {} {}{}",
            post.id, author, heart, post.likes_count, noun, mine
        )?;
        for line in post.content.lines() {
            writeln!(out, "       {line}")?;
        }
    }
    if feed.is_loading() {
        writeln!(out, "Loading more posts...")?;
    } else if feed.has_more() {
        writeln!(out, "-- `more` for older posts --")?;
    } else {
        writeln!(out, "-- end of feed --")?;
    }
    if let Some(notice) = feed.notice() {
        let prefix = match notice.kind {
            NoticeKind::Info => "",
            NoticeKind::Error => "! ",
        };
        writeln!(out, "{prefix}{}", notice.text)?;
    }
    Ok(())
}

fn friendly_path(path: &std::path::Path) -> String {
    if let Some(home) = dirs::home_dir() {
        if let Ok(stripped) = path.strip_prefix(&home) {
            let mut display = String::from("~");
            if !stripped.as_os_str().is_empty() {
                display.push_str(&format!("/{}", stripped.display()));
            }
            return display;
        }
    }
    path.display().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::Post;
    use crate::feed::FeedOptions;

    fn post(id: u64, author: &str) -> Post {
        Post {
            id: PostId(id),
            owner: Some(1),
            owner_username: author.into(),
            owner_profile_image: None,
            content: format!("post {id}"),
            is_owner: author == "you",
            is_liked: false,
            likes_count: 1,
            created_at: None,
            updated_at: None,
        }
    }

    fn session(script: &str, posts: Vec<Post>) -> (FeedController, String) {
        let service = Arc::new(MockPostService::with_posts(posts, 2));
        let mut feed = FeedController::new(service, FeedOptions::default());
        let mut out = Vec::new();
        run_commands(
            &mut feed,
            script.as_bytes(),
            &mut out,
            Duration::from_secs(5),
        )
        .unwrap();
        (feed, String::from_utf8(out).unwrap())
    }

    #[test]
    fn parses_commands_with_arguments() {
        assert_eq!(parse_command("like 4"), Ok(Command::Like(PostId(4))));
        assert_eq!(
            parse_command("edit #3 new words here"),
            Ok(Command::Edit(PostId(3), "new words here".into()))
        );
        assert_eq!(
            parse_command("  post hello world "),
            Ok(Command::Post("hello world".into()))
        );
        assert_eq!(parse_command(""), Ok(Command::List));
        assert!(parse_command("like nope").is_err());
        assert!(parse_command("dance").is_err());
    }

    #[test]
    fn pages_through_sample_feed() {
        let posts = (1..=5).rev().map(|id| post(id, "ana")).collect();
        let (feed, out) = session("more\nmore\nmore\n", posts);

        let ids: Vec<u64> = feed.posts().iter().map(|post| post.id.0).collect();
        assert_eq!(ids, vec![5, 4, 3, 2, 1]);
        assert!(!feed.has_more());
        assert!(out.contains("-- end of feed --"));
        assert!(out.contains("No more posts."));
    }

    #[test]
    fn create_like_and_delete_through_commands() {
        let posts = vec![post(2, "ana"), post(1, "you")];
        let (feed, out) = session("post hello\nlike 2\ndelete 1\nquit\nlike 2\n", posts);

        let ids: Vec<u64> = feed.posts().iter().map(|post| post.id.0).collect();
        assert_eq!(ids, vec![3, 2]);
        assert_eq!(feed.posts()[0].content, "hello");
        let liked = feed.post(PostId(2)).unwrap();
        assert!(liked.is_liked);
        assert_eq!(liked.likes_count, 2);
        assert!(out.contains("@ana  ♥ 2 likes"));
    }

    #[test]
    fn rejects_blank_posts_and_unknown_ids() {
        let (_, out) = session("post   \nlike 99\n", vec![post(1, "ana")]);
        assert!(out.contains("post content cannot be empty"));
        assert!(out.contains("post 99 is not in the feed"));
    }
}
