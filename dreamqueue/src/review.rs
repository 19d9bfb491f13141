//! Admin review of delivered images.
//!
//! Deliveries to admin and turbo chats carry a row of [`ReviewAction`] controls. When one is
//! pressed, the transport adapter passes it to [`ReviewDesk::handle`] and shows the returned
//! answer to the admin.
use std::{fmt::Display, str::FromStr, sync::Arc};

use thiserror::Error;

use crate::{
    backend::{Enhancer, Image, SocialChannel, Transport},
    cache::{CacheError, ImageCache},
    job::{Destination, MessageId},
    settings::SharedSettings,
};

const POST_TO_PREFIX: &str = "post_to_";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ReviewAction {
    FixFace,
    UndoFace,
    /// Copy the message into the primary channel.
    PostToChannel,
    /// Post to the named secondary channel.
    PostTo(String),
    /// Post to the primary channel and every secondary channel.
    PostToAll,
}

impl ReviewAction {
    pub fn callback_data(&self) -> String {
        self.to_string()
    }

    /// Short button label.
    pub fn label(&self) -> String {
        match self {
            Self::FixFace => "Fix face".to_owned(),
            Self::UndoFace => "Undo fix".to_owned(),
            Self::PostToChannel => "Tg".to_owned(),
            Self::PostTo(channel) => channel.clone(),
            Self::PostToAll => "ALL".to_owned(),
        }
    }
}

impl Display for ReviewAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::FixFace => f.write_str("fix_face"),
            Self::UndoFace => f.write_str("undo_face"),
            Self::PostToChannel => f.write_str("post_to_channel"),
            Self::PostTo(channel) => write!(f, "{POST_TO_PREFIX}{channel}"),
            Self::PostToAll => f.write_str("post_to_all"),
        }
    }
}

impl FromStr for ReviewAction {
    type Err = UnknownAction;

    fn from_str(data: &str) -> Result<Self, Self::Err> {
        match data {
            "fix_face" => Ok(Self::FixFace),
            "undo_face" => Ok(Self::UndoFace),
            "post_to_channel" => Ok(Self::PostToChannel),
            "post_to_all" => Ok(Self::PostToAll),
            _ => data
                .strip_prefix(POST_TO_PREFIX)
                .filter(|channel| !channel.is_empty())
                .map(|channel| Self::PostTo(channel.to_owned()))
                .ok_or_else(|| UnknownAction(data.to_owned())),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("Unknown review action {0:?}")]
pub struct UnknownAction(pub String);

/// The controls attached to a reviewable delivery.
///
/// The first control toggles between [`ReviewAction::FixFace`] and [`ReviewAction::UndoFace`].
pub fn review_controls(channels: &[Arc<dyn SocialChannel>], face_fixed: bool) -> Vec<ReviewAction> {
    let face = if face_fixed {
        ReviewAction::UndoFace
    } else {
        ReviewAction::FixFace
    };
    let mut controls = vec![face, ReviewAction::PostToChannel];
    let before = controls.len();
    controls.extend(
        channels
            .iter()
            .filter(|channel| channel.is_available())
            .map(|channel| ReviewAction::PostTo(channel.name().to_owned())),
    );
    if controls.len() > before {
        controls.push(ReviewAction::PostToAll);
    }
    controls
}

/// Runs review actions against delivered messages.
#[derive(Clone)]
pub struct ReviewDesk {
    settings: SharedSettings,
    transport: Arc<dyn Transport>,
    enhancer: Option<Arc<dyn Enhancer>>,
    channels: Vec<Arc<dyn SocialChannel>>,
}

impl ReviewDesk {
    pub fn new(
        settings: SharedSettings,
        transport: Arc<dyn Transport>,
        enhancer: Option<Arc<dyn Enhancer>>,
        channels: Vec<Arc<dyn SocialChannel>>,
    ) -> Self {
        Self {
            settings,
            transport,
            enhancer,
            channels,
        }
    }

    /// Runs `action` on the delivered `message` in `chat` and returns the answer to show.
    ///
    /// `user` is the account that pressed the control and `caption` the caption text of the
    /// message. Only admins are served, in whichever chat the message lives.
    #[tracing::instrument(skip_all, fields(user, %chat, %message, %action))]
    pub async fn handle(
        &self,
        user: i64,
        chat: &Destination,
        message: MessageId,
        caption: &str,
        action: &ReviewAction,
    ) -> String {
        let settings = self.settings.snapshot();
        if !settings.is_admin_user(user) {
            tracing::debug!("Ignoring review action from non admin user");
            return "Not allowed".to_owned();
        }
        let cache = ImageCache::new(&settings.image_cache_dir);

        if *action != ReviewAction::PostToChannel {
            if let Err(err) = self.ensure_cached(&cache, chat, message).await {
                tracing::error!(?err, "Failed to download image with error {err}");
                return "Error downloading image".to_owned();
            }
        }

        match action {
            ReviewAction::FixFace => self.fix_face(&cache, chat, message, caption).await,
            ReviewAction::UndoFace => self.undo_face(&cache, chat, message, caption).await,
            _ => self.post(&cache, chat, message, caption, action).await,
        }
    }

    async fn ensure_cached(
        &self,
        cache: &ImageCache,
        chat: &Destination,
        message: MessageId,
    ) -> Result<(), ReviewError> {
        if cache.contains(message).await? {
            return Ok(());
        }
        let image = self.transport.fetch_image(chat, message).await?;
        cache.store(message, &[image]).await?;
        Ok(())
    }

    async fn fix_face(
        &self,
        cache: &ImageCache,
        chat: &Destination,
        message: MessageId,
        caption: &str,
    ) -> String {
        let Some(enhancer) = self.enhancer.clone() else {
            return "Face restoration unavailable".to_owned();
        };
        let image = match cache.read(message).await {
            Ok(image) => image,
            Err(CacheError::Missing(_)) => return "Image not found".to_owned(),
            Err(err) => {
                tracing::error!(?err, "Failed to read cached image with error {err}");
                return "Image not found".to_owned();
            }
        };

        let fixed = tokio::task::spawn_blocking(move || enhancer.fix_face(&image)).await;
        let fixed = match fixed {
            Ok(Ok(fixed)) => fixed,
            Ok(Err(err)) => {
                tracing::error!(?err, "Failed to fix face with error {err}");
                return "Error fixing face".to_owned();
            }
            Err(err) => {
                tracing::error!(?err, "Face restoration panicked");
                return "Error fixing face".to_owned();
            }
        };

        if let Err(err) = cache.replace_keeping_backup(message, &fixed).await {
            tracing::error!(?err, "Failed to store fixed image with error {err}");
            return "Error fixing face".to_owned();
        }
        self.show(chat, message, &fixed, caption, true).await;
        "Face fixed".to_owned()
    }

    async fn undo_face(
        &self,
        cache: &ImageCache,
        chat: &Destination,
        message: MessageId,
        caption: &str,
    ) -> String {
        let original = match cache.restore_backup(message).await {
            Ok(original) => original,
            Err(err) => {
                tracing::warn!(?err, "Failed to restore image with error {err}");
                return "Image not found".to_owned();
            }
        };
        self.show(chat, message, &original, caption, false).await;
        "Undo face fix".to_owned()
    }

    async fn show(
        &self,
        chat: &Destination,
        message: MessageId,
        image: &Image,
        caption: &str,
        face_fixed: bool,
    ) {
        let controls = review_controls(&self.channels, face_fixed);
        let _ = self
            .transport
            .replace_image(chat, message, image, caption, &controls)
            .await
            .inspect_err(|err| {
                tracing::error!(?err, "Failed to replace image with error {err}");
            });
    }

    async fn post(
        &self,
        cache: &ImageCache,
        chat: &Destination,
        message: MessageId,
        caption: &str,
        action: &ReviewAction,
    ) -> String {
        let mut answer = None;
        let mut sent = false;

        if matches!(action, ReviewAction::PostToChannel | ReviewAction::PostToAll) {
            match self.copy_to_primary(chat, message).await {
                Ok(_) => {
                    sent = true;
                    answer = Some("Posted to Telegram channel".to_owned());
                }
                Err(err) => {
                    tracing::error!(?err, "Failed to post to channel with error {err}");
                    answer = Some("Error posting to channel".to_owned());
                }
            }
        }

        let image = cache.path_for(message, 0);
        for channel in self.channels.iter().filter(|channel| channel.is_available()) {
            let name = channel.name();
            let selected = match action {
                ReviewAction::PostToAll => true,
                ReviewAction::PostTo(target) => target == name,
                _ => false,
            };
            if !selected {
                continue;
            }
            match channel.post(&image, &channel.caption(caption)).await {
                Ok(link) => {
                    tracing::info!(channel = name, %link, "Posted to {name}");
                    sent = true;
                    answer = Some(format!("Posted to {name}"));
                }
                Err(err) => {
                    tracing::error!(
                        ?err,
                        channel = name,
                        "Failed to post to {name} with error {err}"
                    );
                    answer = Some(format!("Error posting to {name}"));
                }
            }
        }

        if sent && *action == ReviewAction::PostToAll {
            let _ = self
                .transport
                .clear_controls(chat, message)
                .await
                .inspect_err(|err| {
                    tracing::error!(?err, "Failed to clear review controls with error {err}");
                });
        }

        answer.unwrap_or_else(|| match action {
            ReviewAction::PostTo(channel) => format!("Channel {channel} unavailable"),
            _ => "Nothing to do".to_owned(),
        })
    }

    async fn copy_to_primary(
        &self,
        chat: &Destination,
        message: MessageId,
    ) -> Result<MessageId, ReviewError> {
        let primary = self
            .settings
            .snapshot()
            .primary_chat
            .clone()
            .ok_or(ReviewError::NoPrimaryChannel)?;
        Ok(self.transport.copy_message(&primary, chat, message).await?)
    }
}

#[derive(Debug, Error)]
enum ReviewError {
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    Delivery(#[from] crate::backend::DeliveryError),
    #[error("No primary channel configured")]
    NoPrimaryChannel,
}

#[cfg(test)]
mod test {
    use assert_matches::assert_matches;

    use crate::{
        backend::MockEnhancer,
        settings::Settings,
        testing::{RecordingChannel, RecordingTransport},
    };

    use super::*;

    const ADMIN: i64 = 100;

    struct Fixture {
        _dir: tempfile::TempDir,
        cache: ImageCache,
        transport: Arc<RecordingTransport>,
        channel: Arc<RecordingChannel>,
        desk: ReviewDesk,
    }

    fn fixture(enhancer: Option<MockEnhancer>) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let settings = SharedSettings::new(Settings {
            admin_ids: vec![ADMIN],
            primary_chat: Some(Destination::from("channel")),
            turbo_chat: Some(Destination::from("turbo")),
            image_cache_dir: dir.path().to_path_buf(),
            ..Settings::default()
        });
        let transport = Arc::new(RecordingTransport::new());
        let channel = Arc::new(RecordingChannel::new("instagram"));
        let desk = ReviewDesk::new(
            settings,
            transport.clone(),
            enhancer.map(|enhancer| Arc::new(enhancer) as Arc<dyn Enhancer>),
            vec![channel.clone()],
        );
        Fixture {
            cache: ImageCache::new(dir.path()),
            _dir: dir,
            transport,
            channel,
            desk,
        }
    }

    fn admin() -> Destination {
        Destination::from(ADMIN)
    }

    #[test]
    fn callback_data_parses_back() {
        for action in [
            ReviewAction::FixFace,
            ReviewAction::UndoFace,
            ReviewAction::PostToChannel,
            ReviewAction::PostTo("twitter".to_owned()),
            ReviewAction::PostToAll,
        ] {
            assert_eq!(action.callback_data().parse::<ReviewAction>(), Ok(action));
        }
        assert_matches!("post_to_".parse::<ReviewAction>(), Err(UnknownAction(_)));
        assert_matches!("delete".parse::<ReviewAction>(), Err(UnknownAction(_)));
    }

    #[test]
    fn controls_include_available_channels() {
        let available: Arc<dyn SocialChannel> = Arc::new(RecordingChannel::new("instagram"));
        let offline: Arc<dyn SocialChannel> =
            Arc::new(RecordingChannel::new("twitter").unavailable());

        assert_eq!(
            review_controls(&[available, offline.clone()], false),
            vec![
                ReviewAction::FixFace,
                ReviewAction::PostToChannel,
                ReviewAction::PostTo("instagram".to_owned()),
                ReviewAction::PostToAll,
            ]
        );
        assert_eq!(
            review_controls(&[offline], true),
            vec![ReviewAction::UndoFace, ReviewAction::PostToChannel]
        );
    }

    #[tokio::test]
    async fn non_admin_is_refused() {
        let fixture = fixture(None);

        let answer = fixture
            .desk
            .handle(7, &admin(), MessageId::from(1), "cap", &ReviewAction::PostToAll)
            .await;

        assert_eq!(answer, "Not allowed");
        assert!(fixture.transport.copies().is_empty());
    }

    #[tokio::test]
    async fn admin_acts_on_turbo_chat_delivery() {
        let fixture = fixture(None);
        let turbo = Destination::from("turbo");

        let answer = fixture
            .desk
            .handle(ADMIN, &turbo, MessageId::from(9), "cap", &ReviewAction::PostToChannel)
            .await;

        assert_eq!(answer, "Posted to Telegram channel");
        assert_eq!(
            fixture.transport.copies(),
            vec![(Destination::from("channel"), turbo, MessageId::from(9))]
        );
    }

    #[tokio::test]
    async fn post_to_channel_copies_message() {
        let fixture = fixture(None);

        let answer = fixture
            .desk
            .handle(ADMIN, &admin(), MessageId::from(9), "cap", &ReviewAction::PostToChannel)
            .await;

        assert_eq!(answer, "Posted to Telegram channel");
        assert_eq!(
            fixture.transport.copies(),
            vec![(Destination::from("channel"), admin(), MessageId::from(9))]
        );
        assert!(fixture.transport.cleared().is_empty());
    }

    #[tokio::test]
    async fn failed_copy_reports_error() {
        let fixture = fixture(None);
        fixture.transport.fail_next(1);

        let answer = fixture
            .desk
            .handle(ADMIN, &admin(), MessageId::from(9), "cap", &ReviewAction::PostToChannel)
            .await;

        assert_eq!(answer, "Error posting to channel");
    }

    #[tokio::test]
    async fn post_to_secondary_downloads_missing_image() {
        let fixture = fixture(None);
        fixture.transport.set_remote_image(Image::new(b"remote".to_vec()));
        let instagram = ReviewAction::PostTo("instagram".to_owned());

        let answer = fixture
            .desk
            .handle(ADMIN, &admin(), MessageId::from(4), "cap", &instagram)
            .await;

        assert_eq!(answer, "Posted to instagram");
        assert_eq!(
            fixture.cache.read(MessageId::from(4)).await.unwrap().as_bytes(),
            b"remote"
        );
        let posts = fixture.channel.posts();
        assert_eq!(posts.len(), 1);
        assert_eq!(posts[0].0, fixture.cache.path_for(MessageId::from(4), 0));
        assert_eq!(posts[0].1, "cap\n#aiart #stablediffusion");
        assert!(fixture.transport.copies().is_empty());
    }

    #[tokio::test]
    async fn post_to_all_clears_controls() {
        let fixture = fixture(None);
        fixture
            .cache
            .store(MessageId::from(4), &[Image::new(b"img".to_vec())])
            .await
            .unwrap();

        fixture
            .desk
            .handle(ADMIN, &admin(), MessageId::from(4), "cap", &ReviewAction::PostToAll)
            .await;

        assert_eq!(fixture.transport.copies().len(), 1);
        assert_eq!(fixture.channel.posts().len(), 1);
        assert_eq!(fixture.transport.cleared(), vec![(admin(), MessageId::from(4))]);
    }

    #[tokio::test]
    async fn unknown_channel() {
        let fixture = fixture(None);
        fixture
            .cache
            .store(MessageId::from(4), &[Image::new(b"img".to_vec())])
            .await
            .unwrap();

        let action = ReviewAction::PostTo("myspace".to_owned());
        let answer = fixture
            .desk
            .handle(ADMIN, &admin(), MessageId::from(4), "cap", &action)
            .await;

        assert_eq!(answer, "Channel myspace unavailable");
    }

    #[tokio::test]
    async fn download_failure() {
        let fixture = fixture(None);

        let answer = fixture
            .desk
            .handle(ADMIN, &admin(), MessageId::from(4), "cap", &ReviewAction::FixFace)
            .await;

        assert_eq!(answer, "Error downloading image");
    }

    #[tokio::test]
    async fn fix_and_undo_face() {
        let mut enhancer = MockEnhancer::new();
        enhancer
            .expect_fix_face()
            .times(1)
            .returning(|_| Ok(Image::new(b"fixed".to_vec())));
        let fixture = fixture(Some(enhancer));
        let message = MessageId::from(4);
        fixture
            .cache
            .store(message, &[Image::new(b"original".to_vec())])
            .await
            .unwrap();

        let answer = fixture
            .desk
            .handle(ADMIN, &admin(), message, "cap", &ReviewAction::FixFace)
            .await;
        assert_eq!(answer, "Face fixed");
        assert_eq!(fixture.cache.read(message).await.unwrap().as_bytes(), b"fixed");

        let answer = fixture
            .desk
            .handle(ADMIN, &admin(), message, "cap", &ReviewAction::UndoFace)
            .await;
        assert_eq!(answer, "Undo face fix");
        assert_eq!(fixture.cache.read(message).await.unwrap().as_bytes(), b"original");

        let replaced = fixture.transport.replaced();
        assert_eq!(replaced.len(), 2);
        assert_eq!(replaced[0].first(), Some(&ReviewAction::UndoFace));
        assert_eq!(replaced[1].first(), Some(&ReviewAction::FixFace));
    }

    #[tokio::test]
    async fn undo_without_fix() {
        let fixture = fixture(None);
        fixture
            .cache
            .store(MessageId::from(4), &[Image::new(b"img".to_vec())])
            .await
            .unwrap();

        let answer = fixture
            .desk
            .handle(ADMIN, &admin(), MessageId::from(4), "cap", &ReviewAction::UndoFace)
            .await;

        assert_eq!(answer, "Image not found");
    }
}
