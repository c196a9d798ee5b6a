use tera::Tera;

pub const POW_TEMPLATE: &str = "pow.html";
pub const CAPTCHA_TEMPLATE: &str = "captcha.html";

/// Challenge pages ship inside the binary; the renderer only ever
/// sees the registered names.
pub fn init() -> anyhow::Result<Tera> {
    let mut tera = Tera::default();
    tera.add_raw_template(POW_TEMPLATE, include_str!("html/pow.html"))?;
    tera.add_raw_template(CAPTCHA_TEMPLATE, include_str!("html/captcha.html"))?;
    tera.autoescape_on(vec!["html"]);
    Ok(tera)
}
