use garage_common::{Asset, LastModified};

const INDEX_HTML: &[u8] = include_bytes!("../web/index.html");
const ICON_PNG: &[u8] = include_bytes!("../web/icon.png");
const APPLE_TOUCH_ICON_PNG: &[u8] = include_bytes!("../web/apple-touch-icon.png");

pub fn bytes(asset: Asset) -> &'static [u8] {
    match asset {
        Asset::Index => INDEX_HTML,
        Asset::Icon => ICON_PNG,
        Asset::AppleTouchIcon => APPLE_TOUCH_ICON_PNG,
    }
}

pub fn last_modified() -> LastModified {
    LastModified::new(env!("GARAGE_BUILD_STAMP"))
}
