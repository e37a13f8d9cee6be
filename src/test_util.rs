#[cfg(test)]
pub(crate) fn with_temp_home<F, R>(func: F) -> R
where
    F: FnOnce(&std::path::Path) -> R,
{
    static HOME_MUTEX: std::sync::Mutex<()> = std::sync::Mutex::new(());
    let _guard = HOME_MUTEX
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    let dir = tempfile::tempdir().expect("tempdir");
    let old_home = std::env::var("HOME").ok();
    // SAFETY: HOME is only mutated while HOME_MUTEX is held.
    unsafe { std::env::set_var("HOME", dir.path()) };
    let result = func(dir.path());
    match old_home {
        Some(old) => unsafe { std::env::set_var("HOME", old) },
        None => unsafe { std::env::remove_var("HOME") },
    }
    result
}

#[cfg(test)]
pub(crate) fn solid_png(width: u32, height: u32, rgba: [u8; 4]) -> Vec<u8> {
    let image = image::RgbaImage::from_pixel(width, height, image::Rgba(rgba));
    let mut bytes = Vec::new();
    image::DynamicImage::ImageRgba8(image)
        .write_to(&mut std::io::Cursor::new(&mut bytes), image::ImageFormat::Png)
        .expect("encode png");
    bytes
}
